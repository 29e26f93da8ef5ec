//! Encrypted, replica-routed file I/O for capability-secured network file systems.
//!
//! A logical file is stored as a sequence of fixed-size encrypted blocks on one
//! or more storage replicas. [`FileSession`] turns arbitrary reads and writes
//! into whole-block operations, keeps the access capability valid, and fails
//! over between replicas on communication errors.
//!
//! ```ignore
//! use xtcrypt_core::{Client, UserCredentials};
//!
//! let client = Client::new(storage, authority, metadata);
//! let session = client.open("volume/file", UserCredentials::new("alice")).await?;
//!
//! session.write(b"ABCD", 0).await?;
//! let mut buf = [0u8; 4];
//! let n = session.read(&mut buf, 0).await?;
//! assert_eq!(&buf[..n], b"ABCD");
//!
//! session.close().await?;
//! ```

pub mod capability;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod memory;
pub mod replica;
pub mod session;
pub mod stats;
pub mod transport;

pub use capability::{Capability, CapabilityLease};
pub use client::Client;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use context::IoContext;
pub use crypto::{BlockCodec, FileKey};
pub use error::SessionError;
pub use lock::{Lock, LockOwner, LockTable};
pub use replica::{ReplicaDescriptor, ReplicaKind, ReplicaRouter};
pub use session::FileSession;
pub use stats::{SessionStats, SessionStatsSnapshot};
pub use transport::{
    CapabilityAuthority, FileId, MetadataResolver, RequestCredentials, ResolvedFile,
    StorageTransport, TransportError, UserCredentials,
};
