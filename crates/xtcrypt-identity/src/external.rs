//! Policy backed by caller-provided lookup functions.

use std::fmt;

use xtcrypt_core::UserCredentials;

use crate::error::IdentityError;
use crate::passwd::PasswdEntry;
use crate::policy::IdentityPolicy;

type CredentialsFn = dyn Fn(u32, u32) -> Result<UserCredentials, IdentityError> + Send + Sync;
type PasswdFn = dyn Fn(&str, &str) -> Result<PasswdEntry, IdentityError> + Send + Sync;

/// An [`IdentityPolicy`] whose lookups are plain functions, for sites that
/// map identities through a directory service or a fixed table.
///
/// A lookup that was not provided fails with [`IdentityError::Policy`].
///
/// ```
/// use xtcrypt_identity::{ExternalPolicy, IdentityPolicy, UserCredentials};
///
/// let policy = ExternalPolicy::new()
///     .with_user_credentials(|uid, _gid| Ok(UserCredentials::new(format!("u{uid}"))));
///
/// assert_eq!(policy.user_credentials(7, 0).unwrap().username, "u7");
/// assert!(policy.passwd("u7", "users").is_err());
/// ```
#[derive(Default)]
pub struct ExternalPolicy {
    user_credentials: Option<Box<CredentialsFn>>,
    passwd: Option<Box<PasswdFn>>,
}

impl ExternalPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user_credentials<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, u32) -> Result<UserCredentials, IdentityError> + Send + Sync + 'static,
    {
        self.user_credentials = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn with_passwd<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> Result<PasswdEntry, IdentityError> + Send + Sync + 'static,
    {
        self.passwd = Some(Box::new(f));
        self
    }
}

impl IdentityPolicy for ExternalPolicy {
    fn user_credentials(&self, uid: u32, gid: u32) -> Result<UserCredentials, IdentityError> {
        match &self.user_credentials {
            Some(f) => f(uid, gid),
            None => Err(IdentityError::Policy(
                "no user credentials lookup configured".into(),
            )),
        }
    }

    fn passwd(&self, user_id: &str, group_id: &str) -> Result<PasswdEntry, IdentityError> {
        match &self.passwd {
            Some(f) => f(user_id, group_id),
            None => Err(IdentityError::Policy("no passwd lookup configured".into())),
        }
    }
}

impl fmt::Debug for ExternalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalPolicy")
            .field("user_credentials", &self.user_credentials.is_some())
            .field("passwd", &self.passwd.is_some())
            .finish()
    }
}
