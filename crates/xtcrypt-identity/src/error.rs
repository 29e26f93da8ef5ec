//! Error types for identity resolution.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving identities.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("no user with uid {0}")]
    UnknownUid(u32),

    #[error("no group with gid {0}")]
    UnknownGid(u32),

    #[error("no user named '{0}'")]
    UnknownUser(String),

    #[error("no group named '{0}'")]
    UnknownGroup(String),

    /// A database line that does not follow the expected format.
    #[error("{database} line {line}: {reason}")]
    Malformed {
        database: &'static str,
        line: usize,
        reason: String,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An external policy refused or failed the lookup.
    #[error("identity policy failed: {0}")]
    Policy(String),

    #[error("cannot determine the current user")]
    NoCurrentUser,
}

impl IdentityError {
    /// Whether the lookup failed because the identity does not exist, as
    /// opposed to a broken database or policy.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IdentityError::UnknownUid(_)
                | IdentityError::UnknownGid(_)
                | IdentityError::UnknownUser(_)
                | IdentityError::UnknownGroup(_)
        )
    }
}
