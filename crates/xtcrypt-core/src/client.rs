//! Opening sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::lock::LockOwner;
use crate::session::{FileSession, SessionParts};
use crate::transport::{
    CapabilityAuthority, FileId, MetadataResolver, StorageTransport, UserCredentials,
};

/// Entry point bundling the services a session talks to.
///
/// Cheap to share behind an `Arc`; every [`open`](Client::open) gets its own
/// lock owner.
pub struct Client {
    storage: Arc<dyn StorageTransport>,
    authority: Arc<dyn CapabilityAuthority>,
    metadata: Arc<dyn MetadataResolver>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    next_owner: AtomicU64,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(
        storage: Arc<dyn StorageTransport>,
        authority: Arc<dyn CapabilityAuthority>,
        metadata: Arc<dyn MetadataResolver>,
    ) -> Self {
        Self {
            storage,
            authority,
            metadata,
            clock: Arc::new(SystemClock),
            config: SessionConfig::default(),
            next_owner: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve `file_id` and open a session on it.
    ///
    /// Fails if the metadata service is unreachable or returns an empty
    /// replica list or a zero block size.
    #[instrument(level = "debug", skip(self, user), fields(user = %user.username))]
    pub async fn open(
        &self,
        file_id: impl Into<FileId> + std::fmt::Debug,
        user: UserCredentials,
    ) -> Result<FileSession, SessionError> {
        let file_id = file_id.into();
        let resolved = self
            .metadata
            .resolve(&file_id, &user)
            .await
            .map_err(|source| SessionError::Resolve {
                file_id: file_id.clone(),
                source,
            })?;

        if resolved.replicas.is_empty() {
            return Err(SessionError::InvalidMetadata {
                file_id,
                reason: "empty replica list".to_string(),
            });
        }
        if resolved.block_size == 0 {
            return Err(SessionError::InvalidMetadata {
                file_id,
                reason: "block size is zero".to_string(),
            });
        }

        let owner = LockOwner(self.next_owner.fetch_add(1, Ordering::Relaxed));
        debug!(
            %file_id,
            replicas = resolved.replicas.len(),
            block_size = resolved.block_size,
            file_size = resolved.file_size,
            %owner,
            "Opening session"
        );

        FileSession::new(SessionParts {
            file_id,
            resolved,
            user,
            owner,
            storage: Arc::clone(&self.storage),
            authority: Arc::clone(&self.authority),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        })
    }
}
