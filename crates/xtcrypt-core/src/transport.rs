//! Interfaces to the services the engine consumes.
//!
//! The engine never speaks a wire protocol itself. Storage nodes, the
//! capability authority and the metadata service are reached through the
//! traits in this module; [`crate::memory`] provides in-process
//! implementations.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::Capability;
use crate::crypto::FileKey;
use crate::replica::ReplicaDescriptor;

/// Logical identifier of a file, immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for FileId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The caller's resolved identity.
///
/// The engine passes it through to the storage transport and the authority
/// without interpreting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub groups: Vec<String>,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// Authorization material attached to every storage request.
#[derive(Debug, Clone, Copy)]
pub struct RequestCredentials<'a> {
    pub capability: &'a Capability,
    pub user: &'a UserCredentials,
}

/// Errors reported by a transport implementation.
///
/// The first three variants are communication failures and trigger replica
/// failover; the rest are application-level answers and surface immediately.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(#[source] io::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),
}

impl TransportError {
    /// Whether the error says nothing about the request itself, only about
    /// reaching the peer.
    pub fn is_communication_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Connection(_)
                | TransportError::MalformedResponse(_)
        )
    }
}

/// Block storage on replica nodes.
///
/// Blocks are opaque sealed objects to the transport.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    /// Fetch a sealed block. `Ok(None)` means the block was never written.
    async fn read_block(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_index: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Store a sealed block, replacing any previous content.
    async fn write_block(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_index: u64,
        sealed: &[u8],
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError>;

    /// Drop every block with index `>= block_count`.
    async fn truncate(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_count: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError>;

    /// Tell a replica that the file changed elsewhere so it can resynchronize.
    async fn notify_update(
        &self,
        _replica: &ReplicaDescriptor,
        _file_id: &FileId,
        _credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Issues fresh capabilities in exchange for current ones.
#[async_trait]
pub trait CapabilityAuthority: Send + Sync {
    async fn renew_capability(
        &self,
        file_id: &FileId,
        current: &Capability,
        user: &UserCredentials,
    ) -> Result<Capability, TransportError>;
}

/// Everything needed to open a session on a file.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// Ordered replica list; the first entry is the initial preference.
    pub replicas: Vec<ReplicaDescriptor>,
    /// Plaintext bytes per encryption block.
    pub block_size: usize,
    pub file_key: Arc<FileKey>,
    pub capability: Capability,
    pub file_size: u64,
}

/// The metadata service, consulted once per open.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(
        &self,
        file_id: &FileId,
        user: &UserCredentials,
    ) -> Result<ResolvedFile, TransportError>;
}
