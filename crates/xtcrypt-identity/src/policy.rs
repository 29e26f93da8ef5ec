//! The lookup interface behind [`UserDatabase`](crate::UserDatabase).

use xtcrypt_core::UserCredentials;

use crate::error::IdentityError;
use crate::passwd::PasswdEntry;

/// Translates between local numeric identities and the names carried in
/// request credentials.
pub trait IdentityPolicy: Send + Sync {
    /// Credentials for a local uid/gid pair. The primary group comes first
    /// in [`UserCredentials::groups`].
    fn user_credentials(&self, uid: u32, gid: u32) -> Result<UserCredentials, IdentityError>;

    /// The local passwd entry for a remote user and group name. The entry's
    /// gid is the gid of `group_id`, which need not be the user's primary
    /// group.
    fn passwd(&self, user_id: &str, group_id: &str) -> Result<PasswdEntry, IdentityError>;
}

impl<P: IdentityPolicy + ?Sized> IdentityPolicy for Box<P> {
    fn user_credentials(&self, uid: u32, gid: u32) -> Result<UserCredentials, IdentityError> {
        (**self).user_credentials(uid, gid)
    }

    fn passwd(&self, user_id: &str, group_id: &str) -> Result<PasswdEntry, IdentityError> {
        (**self).passwd(user_id, group_id)
    }
}
