//! Identity resolution for xtcrypt clients.
//!
//! Maps local user and group identifiers to the [`UserCredentials`] that
//! accompany every request to the metadata and storage services, and maps
//! remote user and group names back to local passwd entries.
//!
//! Lookups go through an [`IdentityPolicy`]. [`PasswdPolicy`] reads
//! passwd(5) and group(5) formatted databases, [`ExternalPolicy`] wraps
//! caller-provided functions, and [`UserDatabase`] caches the answers of
//! either.
//!
//! # Example
//!
//! ```
//! use xtcrypt_identity::{PasswdPolicy, UserDatabase};
//!
//! let policy = PasswdPolicy::parse(
//!     "alice:x:1000:100:Alice:/home/alice:/bin/sh\n",
//!     "users:x:100:\nstaff:x:50:alice\n",
//! )?;
//! let database = UserDatabase::new(policy);
//!
//! let credentials = database.user_credentials(1000, 100)?;
//! assert_eq!(credentials.username, "alice");
//! assert_eq!(credentials.groups, ["users", "staff"]);
//! # Ok::<(), xtcrypt_identity::IdentityError>(())
//! ```

pub mod database;
pub mod error;
pub mod external;
pub mod passwd;
pub mod policy;

pub use database::UserDatabase;
pub use error::IdentityError;
pub use external::ExternalPolicy;
pub use passwd::{GroupEntry, PasswdEntry, PasswdPolicy};
pub use policy::IdentityPolicy;

pub use xtcrypt_core::UserCredentials;
