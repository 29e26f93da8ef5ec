//! Shared fixtures for the session integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use xtcrypt_core::memory::{MemoryAuthority, MemoryMetadata, MemoryStorage};
use xtcrypt_core::{
    Capability, CapabilityAuthority, Client, Clock, FileId, FileSession, LockOwner, ManualClock,
    ReplicaDescriptor, RequestCredentials, SessionConfig, StorageTransport, TransportError,
    UserCredentials,
};

pub const FILE: &str = "volume/dir/file.bin";
pub const CAPABILITY_LIFETIME: Duration = Duration::from_secs(600);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn replicas(count: usize) -> Vec<ReplicaDescriptor> {
    (0..count)
        .map(|i| ReplicaDescriptor::new(format!("osd-{i}:32640"), format!("osd-uuid-{i}")))
        .collect()
}

pub fn address(i: usize) -> String {
    format!("osd-{i}:32640")
}

/// Storage wrapper injecting faults per replica address.
#[derive(Debug)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    /// Connection refused
    pub unreachable: DashSet<String>,
    /// Application-level rejection
    pub rejecting: DashSet<String>,
    /// Never answers
    pub hanging: DashSet<String>,
    /// Successful and failed calls per address
    pub calls: DashMap<String, u64>,
    /// Block fetches per block index
    pub fetched: DashMap<u64, u64>,
    /// Delay added to every write
    pub write_delay: parking_lot::Mutex<Option<Duration>>,
    /// Writes allowed before every further write fails with a connection error
    pub write_budget: parking_lot::Mutex<Option<u64>>,
    /// Truncation rejected on every replica
    pub truncate_rejected: AtomicBool,
}

impl FaultyStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            unreachable: DashSet::new(),
            rejecting: DashSet::new(),
            hanging: DashSet::new(),
            calls: DashMap::new(),
            fetched: DashMap::new(),
            write_delay: parking_lot::Mutex::new(None),
            write_budget: parking_lot::Mutex::new(None),
            truncate_rejected: AtomicBool::new(false),
        }
    }

    pub fn calls_to(&self, address: &str) -> u64 {
        self.calls.get(address).map_or(0, |n| *n)
    }

    pub fn fetches_of(&self, index: u64) -> u64 {
        self.fetched.get(&index).map_or(0, |n| *n)
    }

    async fn gate(&self, replica: &ReplicaDescriptor) -> Result<(), TransportError> {
        *self.calls.entry(replica.address.clone()).or_insert(0) += 1;
        if self.hanging.contains(&replica.address) {
            std::future::pending::<()>().await;
        }
        if self.unreachable.contains(&replica.address) {
            return Err(TransportError::Connection(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        if self.rejecting.contains(&replica.address) {
            return Err(TransportError::Rejected("quota exceeded".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTransport for FaultyStorage {
    async fn read_block(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_index: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.gate(replica).await?;
        *self.fetched.entry(block_index).or_insert(0) += 1;
        self.inner
            .read_block(replica, file_id, block_index, credentials)
            .await
    }

    async fn write_block(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_index: u64,
        sealed: &[u8],
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        self.gate(replica).await?;
        {
            let mut budget = self.write_budget.lock();
            match budget.as_mut() {
                Some(0) => {
                    return Err(TransportError::Connection(std::io::Error::from(
                        std::io::ErrorKind::BrokenPipe,
                    )));
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .write_block(replica, file_id, block_index, sealed, credentials)
            .await
    }

    async fn truncate(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        block_count: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        self.gate(replica).await?;
        if self.truncate_rejected.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("truncate not permitted".into()));
        }
        self.inner
            .truncate(replica, file_id, block_count, credentials)
            .await
    }

    async fn notify_update(
        &self,
        replica: &ReplicaDescriptor,
        file_id: &FileId,
        credentials: RequestCredentials<'_>,
    ) -> Result<(), TransportError> {
        self.gate(replica).await?;
        self.inner.notify_update(replica, file_id, credentials).await
    }
}

/// Authority whose behaviour tests switch at runtime.
#[derive(Debug)]
pub struct ScriptedAuthority {
    pub inner: MemoryAuthority,
    pub failing: AtomicBool,
    pub hanging: AtomicBool,
    pub calls: AtomicU64,
    /// Delay before answering, to let concurrent callers pile up
    pub latency: parking_lot::Mutex<Duration>,
}

impl ScriptedAuthority {
    pub fn new(clock: Arc<ManualClock>, lifetime: Duration) -> Self {
        Self {
            inner: MemoryAuthority::with_clock(clock, lifetime),
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            latency: parking_lot::Mutex::new(Duration::ZERO),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityAuthority for ScriptedAuthority {
    async fn renew_capability(
        &self,
        file_id: &FileId,
        current: &Capability,
        user: &UserCredentials,
    ) -> Result<Capability, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )));
        }
        self.inner.renew_capability(file_id, current, user).await
    }
}

/// A client wired to in-memory services with fault injection.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub storage: Arc<FaultyStorage>,
    pub authority: Arc<ScriptedAuthority>,
    pub metadata: Arc<MemoryMetadata>,
    pub client: Client,
}

impl Harness {
    /// `replica_count` independent replicas, background renewal disabled.
    pub fn new(replica_count: usize, block_size: usize) -> Self {
        Self::build(MemoryStorage::new(), replica_count, block_size, test_config())
    }

    /// Replicas sharing one block store.
    pub fn shared(replica_count: usize, block_size: usize) -> Self {
        Self::build(MemoryStorage::shared(), replica_count, block_size, test_config())
    }

    pub fn with_config(replica_count: usize, block_size: usize, config: SessionConfig) -> Self {
        Self::build(MemoryStorage::new(), replica_count, block_size, config)
    }

    fn build(
        storage: MemoryStorage,
        replica_count: usize,
        block_size: usize,
        config: SessionConfig,
    ) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(FaultyStorage::new(storage.with_clock(clock.clone())));
        let authority = Arc::new(ScriptedAuthority::new(clock.clone(), CAPABILITY_LIFETIME));
        let metadata = Arc::new(MemoryMetadata::new(Arc::new(MemoryAuthority::with_clock(
            clock.clone(),
            CAPABILITY_LIFETIME,
        ))));
        metadata.create(FILE, replicas(replica_count), block_size);

        let client = Client::new(storage.clone(), authority.clone(), metadata.clone())
            .with_clock(clock.clone())
            .with_config(config);

        Self {
            clock,
            storage,
            authority,
            metadata,
            client,
        }
    }

    pub async fn open(&self) -> FileSession {
        self.client
            .open(FILE, UserCredentials::new("alice").with_group("users"))
            .await
            .expect("open failed")
    }

    /// Read `len` bytes at `offset`, returning only the bytes read.
    pub async fn read(session: &FileSession, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = session.read(&mut buf, offset).await.expect("read failed");
        buf.truncate(n);
        buf
    }

    pub async fn read_as_owner(
        session: &FileSession,
        offset: u64,
        len: usize,
        owner: LockOwner,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = session
            .read_as(&mut buf, offset, owner)
            .await
            .expect("read failed");
        buf.truncate(n);
        buf
    }

    pub fn now(&self) -> std::time::SystemTime {
        self.clock.now()
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig::default()
        .renewal_period(None)
        .io_timeout(Duration::from_secs(1))
        .renewal_timeout(Duration::from_secs(1))
}
