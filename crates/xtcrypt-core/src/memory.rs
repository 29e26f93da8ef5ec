//! In-process storage, authority and metadata backends.
//!
//! Useful for embedding the engine without a network and for tests. Blocks
//! are kept per replica address unless the storage is created with
//! [`MemoryStorage::shared`], in which case every replica sees the same
//! blocks, as if the nodes replicated among themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rand::RngCore;
use tracing::trace;

use crate::capability::Capability;
use crate::clock::{Clock, SystemClock};
use crate::crypto::FileKey;
use crate::replica::ReplicaDescriptor;
use crate::transport::{
    CapabilityAuthority, FileId, MetadataResolver, RequestCredentials, ResolvedFile,
    StorageTransport, TransportError, UserCredentials,
};

type BlockKey = (String, FileId, u64);

/// Block store holding sealed blocks in memory.
///
/// When given a clock, requests carrying an expired capability are refused
/// with [`TransportError::Unauthorized`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blocks: DashMap<BlockKey, Vec<u8>>,
    shared: bool,
    clock: Option<Arc<dyn Clock>>,
    notifications: DashMap<String, u64>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStorage {
    /// Storage with one independent block map per replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose replicas all see the same blocks.
    pub fn shared() -> Self {
        Self {
            shared: true,
            ..Self::default()
        }
    }

    /// Enforce capability expiry against `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The sealed block stored for `file_id` at `index` on `address`.
    pub fn block(&self, address: &str, file_id: &FileId, index: u64) -> Option<Vec<u8>> {
        self.blocks
            .get(&self.key(address, file_id, index))
            .map(|b| b.clone())
    }

    /// Overwrite a stored block, bypassing every check.
    pub fn put_raw(&self, address: &str, file_id: &FileId, index: u64, sealed: Vec<u8>) {
        self.blocks.insert(self.key(address, file_id, index), sealed);
    }

    /// Indices of the blocks stored for `file_id` on `address`, ascending.
    pub fn stored_blocks(&self, address: &str, file_id: &FileId) -> Vec<u64> {
        let replica = self.replica_key(address);
        let mut indices: Vec<u64> = self
            .blocks
            .iter()
            .filter(|entry| entry.key().0 == replica && &entry.key().1 == file_id)
            .map(|entry| entry.key().2)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Update notifications received by `address`.
    pub fn notifications(&self, address: &str) -> u64 {
        self.notifications.get(address).map_or(0, |n| *n)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn replica_key(&self, address: &str) -> String {
        if self.shared {
            String::new()
        } else {
            address.to_string()
        }
    }

    fn key(&self, address: &str, file_id: &FileId, index: u64) -> BlockKey {
        (self.replica_key(address), file_id.clone(), index)
    }

    fn authorize(&self, credentials: RequestCredentials<'_>) -> Result<(), TransportError> {
        if let Some(clock) = &self.clock
            && credentials.capability.is_expired(clock.now())
        {
            return Err(TransportError::Unauthorized("capability expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTransport for MemoryStorage {
    async fn read_block(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_index: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.authorize(credentials)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        trace!(replica = %replica.address, block = block_index, "Memory read");
        Ok(self.block(&replica.address, file_id, block_index))
    }

    async fn write_block(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_index: u64,
        sealed: &[u8],
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        self.authorize(credentials)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(replica = %replica.address, block = block_index, "Memory write");
        self.put_raw(&replica.address, file_id, block_index, sealed.to_vec());
        Ok(())
    }

    async fn truncate(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_count: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        self.authorize(credentials)?;
        let target = self.replica_key(&replica.address);
        self.blocks
            .retain(|(address, id, index), _| {
                !(address == &target && id == file_id && *index >= block_count)
            });
        Ok(())
    }

    async fn notify_update(
        &self,
        replica: &ReplicaDescriptor,
        _file_id: &FileId,
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        self.authorize(credentials)?;
        *self
            .notifications
            .entry(replica.address.clone())
            .or_insert(0) += 1;
        Ok(())
    }
}

/// Authority issuing random tokens valid for a fixed lifetime.
#[derive(Debug)]
pub struct MemoryAuthority {
    clock: Arc<dyn Clock>,
    lifetime: Duration,
    revoked: DashSet<FileId>,
    issued: AtomicU64,
}

impl MemoryAuthority {
    pub fn new(lifetime: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), lifetime)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, lifetime: Duration) -> Self {
        Self {
            clock,
            lifetime,
            revoked: DashSet::new(),
            issued: AtomicU64::new(0),
        }
    }

    /// A fresh capability expiring one lifetime from now.
    pub fn issue(&self) -> Capability {
        self.issued.fetch_add(1, Ordering::Relaxed);
        let mut token = [0u8; 16];
        rand::rng().fill_bytes(&mut token);
        Capability::new(hex::encode(token).into_bytes(), self.clock.now() + self.lifetime)
    }

    /// Refuse all further renewals for `file_id`.
    pub fn revoke(&self, file_id: &FileId) {
        self.revoked.insert(file_id.clone());
    }

    /// Capabilities issued so far, including renewals.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CapabilityAuthority for MemoryAuthority {
    async fn renew_capability(
        &self,
        file_id: &FileId,
        _current: &Capability,
        _user: &UserCredentials,
    ) -> Result<Capability, TransportError> {
        if self.revoked.contains(file_id) {
            return Err(TransportError::Rejected(format!("capability for '{file_id}' revoked")));
        }
        Ok(self.issue())
    }
}

#[derive(Debug, Clone)]
struct FileEntry {
    replicas: Vec<ReplicaDescriptor>,
    block_size: usize,
    file_key: Arc<FileKey>,
    file_size: u64,
}

/// Registry of files, issuing a capability on every resolve.
#[derive(Debug)]
pub struct MemoryMetadata {
    files: DashMap<FileId, FileEntry>,
    authority: Arc<MemoryAuthority>,
}

impl MemoryMetadata {
    pub fn new(authority: Arc<MemoryAuthority>) -> Self {
        Self {
            files: DashMap::new(),
            authority,
        }
    }

    /// Register an empty file with a random key.
    pub fn create(
        &self,
        file_id: impl Into<FileId>,
        replicas: Vec<ReplicaDescriptor>,
        block_size: usize,
    ) -> Arc<FileKey> {
        let file_key = Arc::new(FileKey::random());
        self.register(file_id, replicas, block_size, Arc::clone(&file_key), 0);
        file_key
    }

    pub fn register(
        &self,
        file_id: impl Into<FileId>,
        replicas: Vec<ReplicaDescriptor>,
        block_size: usize,
        file_key: Arc<FileKey>,
        file_size: u64,
    ) {
        self.files.insert(
            file_id.into(),
            FileEntry {
                replicas,
                block_size,
                file_key,
                file_size,
            },
        );
    }

    /// Record a new size, e.g. after a session closed.
    pub fn set_size(&self, file_id: &FileId, file_size: u64) -> bool {
        match self.files.get_mut(file_id) {
            Some(mut entry) => {
                entry.file_size = file_size;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MetadataResolver for MemoryMetadata {
    async fn resolve(
        &self,
        file_id: &FileId,
        _user: &UserCredentials,
    ) -> Result<ResolvedFile, TransportError> {
        let entry = self
            .files
            .get(file_id)
            .map(|e| e.clone())
            .ok_or_else(|| TransportError::Rejected(format!("no such file: '{file_id}'")))?;

        Ok(ResolvedFile {
            replicas: entry.replicas,
            block_size: entry.block_size,
            file_key: entry.file_key,
            capability: self.authority.issue(),
            file_size: entry.file_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn credentials_for<'a>(
        capability: &'a Capability,
        user: &'a UserCredentials,
    ) -> RequestCredentials<'a> {
        RequestCredentials { capability, user }
    }

    #[tokio::test]
    async fn test_replicas_are_independent() {
        let storage = MemoryStorage::new();
        let file = FileId::from("f");
        let (a, b) = (
            ReplicaDescriptor::new("a:1", "a"),
            ReplicaDescriptor::new("b:1", "b"),
        );
        let capability = MemoryAuthority::new(Duration::from_secs(60)).issue();
        let user = UserCredentials::new("u");
        let creds = credentials_for(&capability, &user);

        storage.write_block(&a, &file, 0, b"sealed", creds).await.unwrap();
        assert_eq!(
            storage.read_block(&a, &file, 0, creds).await.unwrap(),
            Some(b"sealed".to_vec())
        );
        assert_eq!(storage.read_block(&b, &file, 0, creds).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shared_storage_and_truncate() {
        let storage = MemoryStorage::shared();
        let file = FileId::from("f");
        let (a, b) = (
            ReplicaDescriptor::new("a:1", "a"),
            ReplicaDescriptor::new("b:1", "b"),
        );
        let capability = MemoryAuthority::new(Duration::from_secs(60)).issue();
        let user = UserCredentials::new("u");
        let creds = credentials_for(&capability, &user);

        for index in 0..4 {
            storage.write_block(&a, &file, index, b"x", creds).await.unwrap();
        }
        assert_eq!(storage.stored_blocks("b:1", &file), vec![0, 1, 2, 3]);

        storage.truncate(&b, &file, 2, creds).await.unwrap();
        assert_eq!(storage.stored_blocks("a:1", &file), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_expired_capability_refused() {
        let clock = Arc::new(ManualClock::default());
        let storage = MemoryStorage::new().with_clock(clock.clone());
        let authority = MemoryAuthority::with_clock(clock.clone(), Duration::from_secs(10));
        let capability = authority.issue();
        let user = UserCredentials::new("u");
        let replica = ReplicaDescriptor::new("a:1", "a");

        clock.advance(Duration::from_secs(10));
        let result = storage
            .read_block(&replica, &FileId::from("f"), 0, credentials_for(&capability, &user))
            .await;
        assert!(matches!(result, Err(TransportError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_authority_revocation() {
        let authority = MemoryAuthority::new(Duration::from_secs(60));
        let file = FileId::from("f");
        let current = authority.issue();
        let user = UserCredentials::new("u");

        let renewed = authority.renew_capability(&file, &current, &user).await.unwrap();
        assert_ne!(renewed.token(), current.token());
        assert_eq!(renewed.token().len(), 32);

        authority.revoke(&file);
        assert!(authority.renew_capability(&file, &current, &user).await.is_err());
        assert_eq!(authority.issued(), 2);
    }

    #[tokio::test]
    async fn test_metadata_resolve() {
        let authority = Arc::new(MemoryAuthority::new(Duration::from_secs(60)));
        let metadata = MemoryMetadata::new(authority);
        let user = UserCredentials::new("u");
        metadata.create("vol/a", vec![ReplicaDescriptor::new("a:1", "a")], 4096);

        let resolved = metadata.resolve(&FileId::from("vol/a"), &user).await.unwrap();
        assert_eq!(resolved.block_size, 4096);
        assert_eq!(resolved.file_size, 0);

        assert!(metadata.set_size(&FileId::from("vol/a"), 10));
        let resolved = metadata.resolve(&FileId::from("vol/a"), &user).await.unwrap();
        assert_eq!(resolved.file_size, 10);

        assert!(metadata.resolve(&FileId::from("vol/missing"), &user).await.is_err());
    }
}
