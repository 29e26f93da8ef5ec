//! Caching front end over an [`IdentityPolicy`].

use std::fmt;

use dashmap::DashMap;
use tracing::{debug, trace};
use xtcrypt_core::UserCredentials;

use crate::error::IdentityError;
use crate::passwd::PasswdEntry;
use crate::policy::IdentityPolicy;

/// Resolves identities through a policy and remembers every successful
/// answer for the lifetime of the database.
///
/// Failed lookups are not cached, so an identity added to the underlying
/// database later is found on the next call.
pub struct UserDatabase {
    policy: Box<dyn IdentityPolicy>,
    /// Keyed by (gid, uid)
    credentials: DashMap<(u32, u32), UserCredentials>,
    /// Keyed by (group_id, user_id)
    passwd: DashMap<(String, String), PasswdEntry>,
}

impl UserDatabase {
    pub fn new(policy: impl IdentityPolicy + 'static) -> Self {
        Self {
            policy: Box::new(policy),
            credentials: DashMap::new(),
            passwd: DashMap::new(),
        }
    }

    pub fn user_credentials(&self, uid: u32, gid: u32) -> Result<UserCredentials, IdentityError> {
        if let Some(hit) = self.credentials.get(&(gid, uid)) {
            trace!(uid, gid, "Credentials cache hit");
            return Ok(hit.clone());
        }

        let credentials = self.policy.user_credentials(uid, gid)?;
        debug!(uid, gid, username = %credentials.username, "Resolved user credentials");
        self.credentials.insert((gid, uid), credentials.clone());
        Ok(credentials)
    }

    pub fn passwd(&self, user_id: &str, group_id: &str) -> Result<PasswdEntry, IdentityError> {
        let key = (group_id.to_string(), user_id.to_string());
        if let Some(hit) = self.passwd.get(&key) {
            trace!(user_id, group_id, "Passwd cache hit");
            return Ok(hit.clone());
        }

        let entry = self.policy.passwd(user_id, group_id)?;
        debug!(user_id, group_id, uid = entry.uid, gid = entry.gid, "Resolved passwd entry");
        self.passwd.insert(key, entry.clone());
        Ok(entry)
    }

    /// Credentials of the running process: its real uid and gid resolved
    /// through the policy.
    #[cfg(unix)]
    pub fn current_user_credentials(&self) -> Result<UserCredentials, IdentityError> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        self.user_credentials(uid, gid)
    }

    /// Credentials of the running process, taken from the login name in the
    /// environment.
    #[cfg(not(unix))]
    pub fn current_user_credentials(&self) -> Result<UserCredentials, IdentityError> {
        ["USER", "LOGNAME", "USERNAME"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .map(UserCredentials::new)
            .ok_or(IdentityError::NoCurrentUser)
    }

    /// Number of cached credentials and passwd entries.
    pub fn cached_entries(&self) -> (usize, usize) {
        (self.credentials.len(), self.passwd.len())
    }

    pub fn clear_cache(&self) {
        self.credentials.clear();
        self.passwd.clear();
    }
}

impl fmt::Debug for UserDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDatabase")
            .field("cached_credentials", &self.credentials.len())
            .field("cached_passwd", &self.passwd.len())
            .finish_non_exhaustive()
    }
}
