//! Block store: the worker's bounded block cache.
//!
//! The store is the central coordinator for cached blocks. It:
//! - Admits blocks against the capacity ledger, evicting LRU victims on pressure
//! - Serves reads to lease holders and refreshes recency
//! - Refuses to remove or evict any block with an outstanding lease
//! - Appends every residency change to the heartbeat delta
//!
//! Table, ledger and leases share one lock. Admission checks space, picks
//! victims, removes them and registers the new block without releasing it,
//! so two admits can never both claim the same freed bytes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::block::{
    AccessClock, BlockDescriptor, BlockId, BlockState, BlockTable, CachedBlock, SessionId,
};
use crate::cache::evictor::LruEvictor;
use crate::cache::lock::{Lease, LeaseKind, LockManager, ReclaimedLease};
use crate::config::Config;
use crate::heartbeat::delta::{BlockDelta, DeltaBuffer};
use crate::metrics::CacheMetrics;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Insufficient space for block {block_id}: need {required} bytes, only {available} can be made free")]
    InsufficientSpace {
        block_id: BlockId,
        required: u64,
        available: u64,
    },

    #[error("Block {0} is locked by an active lease")]
    BlockLocked(BlockId),

    #[error("Block {0} not found")]
    BlockNotFound(BlockId),

    #[error("Block {0} is not resident")]
    BlockNotResident(BlockId),

    #[error("Read of {length} bytes at offset {offset} is out of range for block {block_id} ({size} bytes)")]
    OutOfRange {
        block_id: BlockId,
        offset: u64,
        length: u64,
        size: u64,
    },

    #[error("Block {0} already exists")]
    BlockAlreadyExists(BlockId),

    #[error("Lease {lease_id} on block {block_id} is no longer held")]
    LeaseNotHeld { lease_id: u64, block_id: BlockId },
}

impl StoreError {
    /// How many bytes an admission fell short by, if this is a space failure.
    pub fn bytes_short(&self) -> Option<u64> {
        match self {
            StoreError::InsufficientSpace {
                required, available, ..
            } => Some(required.saturating_sub(*available)),
            _ => None,
        }
    }
}

/// Snapshot of the capacity ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

impl Usage {
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64
    }
}

/// A successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub block_id: BlockId,
    pub size: u64,
    /// Blocks evicted to make room, oldest first.
    pub evicted: Vec<BlockDescriptor>,
}

#[derive(Debug, Default)]
struct StoreState {
    table: BlockTable,
    locks: LockManager,
    used_bytes: u64,
    clock: AccessClock,
}

/// The worker's block cache.
pub struct BlockStore {
    state: Mutex<StoreState>,

    /// Woken whenever a lease goes away, so blocked writers can retry.
    lease_released: Notify,

    evictor: LruEvictor,

    /// Residency changes for the next heartbeat.
    delta: Arc<DeltaBuffer>,

    metrics: CacheMetrics,

    config: Arc<Config>,
}

impl BlockStore {
    /// Create an empty store with the configured capacity.
    pub fn new(config: Arc<Config>, delta: Arc<DeltaBuffer>, metrics: CacheMetrics) -> Self {
        metrics
            .capacity_bytes
            .set(config.worker.capacity_bytes as i64);
        metrics.used_bytes.set(0);

        Self {
            state: Mutex::new(StoreState::default()),
            lease_released: Notify::new(),
            evictor: LruEvictor::new(),
            delta,
            metrics,
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.config.worker.capacity_bytes
    }

    /// Acquire a lease on a block.
    ///
    /// Never fails. Read leases are granted immediately; a write lease waits
    /// until any other write lease on the same block is released.
    pub async fn acquire(&self, block_id: BlockId, kind: LeaseKind, session: SessionId) -> Lease {
        loop {
            let released = self.lease_released.notified();
            tokio::pin!(released);
            // Register interest before checking so a release in between is not missed.
            released.as_mut().enable();

            let granted = {
                let mut state = self.state();
                state
                    .locks
                    .try_acquire(block_id, kind, session, Instant::now())
            };
            if let Some(lease) = granted {
                debug!(block_id, lease_id = lease.id(), %kind, %session, "Lease acquired");
                return lease;
            }

            debug!(block_id, %session, "Waiting for write lease");
            released.await;
        }
    }

    /// Release a lease. Returns false if it had already been reclaimed.
    pub fn release(&self, lease: Lease) -> bool {
        let released = {
            let mut guard = self.state();
            let state = &mut *guard;
            let released = state.locks.release(&lease);
            if released && lease.kind() == LeaseKind::Write {
                Self::discard_pending(&mut state.table, lease.block_id());
            }
            released
        };
        self.lease_released.notify_waiters();

        if released {
            debug!(block_id = lease.block_id(), lease_id = lease.id(), "Lease released");
        } else {
            debug!(
                block_id = lease.block_id(),
                lease_id = lease.id(),
                "Lease already reclaimed"
            );
        }
        released
    }

    /// Mark a lease as in use so the timeout sweep leaves it alone.
    ///
    /// Returns false if the lease was already reclaimed.
    pub fn renew(&self, lease: &Lease) -> bool {
        self.state().locks.renew(lease, Instant::now())
    }

    /// Drop every lease held by a session that went away without closing.
    pub fn release_session(&self, session: SessionId) -> usize {
        let released = {
            let mut guard = self.state();
            let state = &mut *guard;
            let released = state.locks.release_session(session);
            Self::discard_abandoned_writes(&mut state.table, &released);
            released
        };
        self.lease_released.notify_waiters();

        if !released.is_empty() {
            info!(%session, leases = released.len(), "Released session leases");
            self.metrics.reclaimed_leases.inc_by(released.len() as u64);
        }
        released.len()
    }

    /// Drop leases idle for longer than the configured lease timeout.
    pub fn reclaim_expired_leases(&self) -> usize {
        let reclaimed = {
            let mut guard = self.state();
            self.reclaim_expired_locked(&mut guard)
        };
        if reclaimed > 0 {
            self.lease_released.notify_waiters();
        }
        reclaimed
    }

    fn reclaim_expired_locked(&self, state: &mut StoreState) -> usize {
        let reclaimed = state
            .locks
            .reclaim_expired(Instant::now(), self.config.lease_timeout());
        for lease in &reclaimed {
            warn!(
                block_id = lease.block_id,
                lease_id = lease.lease_id,
                kind = %lease.kind,
                session = %lease.session,
                "Reclaimed expired lease"
            );
        }
        Self::discard_abandoned_writes(&mut state.table, &reclaimed);
        self.metrics.reclaimed_leases.inc_by(reclaimed.len() as u64);
        reclaimed.len()
    }

    fn discard_abandoned_writes(table: &mut BlockTable, leases: &[ReclaimedLease]) {
        for lease in leases.iter().filter(|l| l.kind == LeaseKind::Write) {
            Self::discard_pending(table, lease.block_id);
        }
    }

    fn discard_pending(table: &mut BlockTable, block_id: BlockId) {
        if table
            .get(block_id)
            .is_some_and(|block| block.state == BlockState::Pending)
        {
            table.remove(block_id);
            debug!(block_id, "Discarded pending block");
        }
    }

    /// Start writing a block: take its write lease and register it as pending.
    pub async fn begin_write(
        &self,
        block_id: BlockId,
        session: SessionId,
    ) -> Result<Lease, StoreError> {
        if self.is_resident(block_id) {
            return Err(StoreError::BlockAlreadyExists(block_id));
        }

        let lease = self.acquire(block_id, LeaseKind::Write, session).await;

        let mut guard = self.state();
        let state = &mut *guard;
        if state.table.get(block_id).is_some_and(CachedBlock::is_resident) {
            // Another writer finished this block while we waited.
            state.locks.release(&lease);
            drop(guard);
            self.lease_released.notify_waiters();
            return Err(StoreError::BlockAlreadyExists(block_id));
        }

        let now = state.clock.tick();
        state.table.insert(CachedBlock::pending(block_id, now));
        debug!(block_id, %session, "Block pending");
        Ok(lease)
    }

    /// Admit a fully written block, evicting LRU blocks if space is short.
    ///
    /// On `InsufficientSpace` nothing changes: no victim is removed, the
    /// ledger is untouched and the heartbeat delta gets no entry.
    pub fn admit(
        &self,
        block_id: BlockId,
        data: Bytes,
        session: SessionId,
    ) -> Result<Admission, StoreError> {
        let size = data.len() as u64;
        let capacity = self.capacity_bytes();

        let mut guard = self.state();
        let state = &mut *guard;

        if state.table.get(block_id).is_some_and(CachedBlock::is_resident) {
            return Err(StoreError::BlockAlreadyExists(block_id));
        }
        if state.locks.writer(block_id).is_some_and(|w| w != session) {
            return Err(StoreError::BlockLocked(block_id));
        }

        let free = capacity.saturating_sub(state.used_bytes);
        let mut evicted = Vec::new();

        if size > free {
            if self.reclaim_expired_locked(state) > 0 {
                self.lease_released.notify_waiters();
            }

            let required = size - free;
            let victims = self.evictor.select_victims(
                state.table.iter(),
                required,
                |id| state.locks.is_locked(id),
            );

            if size > capacity || !victims.covers(required) {
                Self::discard_pending(&mut state.table, block_id);
                self.metrics.rejected_admissions.inc();
                let available = free + victims.bytes;
                warn!(
                    block_id,
                    size,
                    available,
                    short = size.saturating_sub(available),
                    "Admission rejected: not enough evictable space"
                );
                return Err(StoreError::InsufficientSpace {
                    block_id,
                    required: size,
                    available,
                });
            }

            for victim in victims.block_ids {
                if let Some(mut block) = state.table.remove(victim) {
                    state.used_bytes -= block.size;
                    self.delta.record_removed(victim);
                    self.metrics.evicted_blocks.inc();
                    debug!(block_id = victim, size = block.size, "Evicted block");

                    block.state = BlockState::Evicted;
                    evicted.push(Self::descriptor(&block, 0));
                }
            }
        }

        let now = state.clock.tick();
        state.table.insert(CachedBlock::resident(block_id, data, now));
        state.used_bytes += size;
        debug_assert!(state.used_bytes <= capacity);

        self.delta.record_added(block_id, size);
        self.metrics.admitted_blocks.inc();
        self.metrics.used_bytes.set(state.used_bytes as i64);

        if evicted.is_empty() {
            debug!(block_id, size, used = state.used_bytes, "Admitted block");
        } else {
            info!(
                block_id,
                size,
                evicted = evicted.len(),
                used = state.used_bytes,
                "Admitted block after eviction"
            );
        }

        Ok(Admission {
            block_id,
            size,
            evicted,
        })
    }

    /// Read `length` bytes at `offset` from a resident block.
    ///
    /// The caller must hold a live lease on the block. Each successful read
    /// refreshes the block's recency and renews the lease. Only validation
    /// happens under the lock; the slice is cut after it is released.
    pub fn read(&self, lease: &Lease, offset: u64, length: u64) -> Result<Bytes, StoreError> {
        let block_id = lease.block_id();

        let data = {
            let mut guard = self.state();
            let state = &mut *guard;

            if !state.locks.is_active(lease) {
                return Err(StoreError::LeaseNotHeld {
                    lease_id: lease.id(),
                    block_id,
                });
            }

            let block = state
                .table
                .get_mut(block_id)
                .ok_or(StoreError::BlockNotFound(block_id))?;
            let data = match (&block.data, block.state) {
                (Some(data), BlockState::Resident) => data.clone(),
                _ => return Err(StoreError::BlockNotResident(block_id)),
            };
            match offset.checked_add(length) {
                Some(end) if end <= block.size => {}
                _ => {
                    return Err(StoreError::OutOfRange {
                        block_id,
                        offset,
                        length,
                        size: block.size,
                    })
                }
            }

            block.touch(state.clock.tick());
            state.locks.renew(lease, Instant::now());
            data
        };

        Ok(data.slice(offset as usize..(offset + length) as usize))
    }

    /// Remove a block from the cache.
    ///
    /// Refused while any lease is outstanding; that refusal is what makes a
    /// lease pin its block.
    pub fn remove(&self, block_id: BlockId) -> Result<BlockDescriptor, StoreError> {
        let mut guard = self.state();
        let state = &mut *guard;

        if !state.table.contains(block_id) {
            return Err(StoreError::BlockNotFound(block_id));
        }
        if state.locks.is_locked(block_id) {
            return Err(StoreError::BlockLocked(block_id));
        }

        let block = state
            .table
            .remove(block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        if block.is_resident() {
            state.used_bytes -= block.size;
            self.delta.record_removed(block_id);
            self.metrics.removed_blocks.inc();
            self.metrics.used_bytes.set(state.used_bytes as i64);
        }

        debug!(block_id, size = block.size, used = state.used_bytes, "Removed block");
        Ok(Self::descriptor(&block, 0))
    }

    /// Swap out the pending delta together with the ledger it describes.
    ///
    /// Deltas are recorded under the store lock, so taking both under it
    /// gives a `used_bytes` that matches the reported block set.
    pub fn drain_delta(&self) -> (BlockDelta, Usage) {
        let state = self.state();
        let delta = self.delta.take();
        let usage = Usage {
            used_bytes: state.used_bytes,
            capacity_bytes: self.capacity_bytes(),
        };
        (delta, usage)
    }

    /// Current ledger snapshot. Touches neither the ledger nor recency.
    pub fn current_usage(&self) -> Usage {
        Usage {
            used_bytes: self.state().used_bytes,
            capacity_bytes: self.capacity_bytes(),
        }
    }

    pub fn is_resident(&self, block_id: BlockId) -> bool {
        self.state()
            .table
            .get(block_id)
            .is_some_and(CachedBlock::is_resident)
    }

    /// Whether the block has at least one active lease.
    pub fn is_locked(&self, block_id: BlockId) -> bool {
        self.state().locks.is_locked(block_id)
    }

    /// Metadata for a block, without touching its recency.
    pub fn describe(&self, block_id: BlockId) -> Option<BlockDescriptor> {
        let state = self.state();
        let block = state.table.get(block_id)?;
        Some(Self::descriptor(block, state.locks.lease_count(block_id)))
    }

    /// All resident blocks in block ID order.
    pub fn resident_blocks(&self) -> Vec<BlockDescriptor> {
        let state = self.state();
        let mut blocks: Vec<BlockDescriptor> = state
            .table
            .iter()
            .filter(|block| block.is_resident())
            .map(|block| Self::descriptor(block, state.locks.lease_count(block.id)))
            .collect();
        blocks.sort_by_key(|block| block.id);
        blocks
    }

    /// Total number of outstanding leases.
    pub fn active_leases(&self) -> usize {
        self.state().locks.active_leases()
    }

    fn descriptor(block: &CachedBlock, lease_count: usize) -> BlockDescriptor {
        BlockDescriptor {
            id: block.id,
            size: block.size,
            state: block.state,
            last_access: block.last_access,
            lease_count,
        }
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("usage", &self.current_usage())
            .finish_non_exhaustive()
    }
}

/// Thread-safe handle to the store.
pub type SharedStore = Arc<BlockStore>;

/// Create a store wired to a delta buffer and metrics.
pub fn new_shared_store(
    config: Arc<Config>,
    delta: Arc<DeltaBuffer>,
    metrics: CacheMetrics,
) -> SharedStore {
    Arc::new(BlockStore::new(config, delta, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_store(capacity: u64) -> (BlockStore, Arc<DeltaBuffer>) {
        let mut config = Config::default();
        config.worker.capacity_bytes = capacity;
        let delta = Arc::new(DeltaBuffer::new());
        let store = BlockStore::new(Arc::new(config), delta.clone(), CacheMetrics::new().unwrap());
        (store, delta)
    }

    fn bytes(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    #[test]
    fn test_admit_and_usage() {
        let (store, delta) = test_store(10_000);
        let session = SessionId::new();

        let admission = store.admit(1, bytes(4000), session).unwrap();
        assert_eq!(admission.size, 4000);
        assert!(admission.evicted.is_empty());

        let usage = store.current_usage();
        assert_eq!(usage.used_bytes, 4000);
        assert_eq!(usage.free_bytes(), 6000);
        assert_eq!(delta.snapshot().added(), vec![(1, 4000)]);
    }

    #[test]
    fn test_admit_twice_is_rejected() {
        let (store, _) = test_store(10_000);
        let session = SessionId::new();
        store.admit(1, bytes(10), session).unwrap();
        assert_eq!(
            store.admit(1, bytes(10), session),
            Err(StoreError::BlockAlreadyExists(1))
        );

        // After removal the same ID is a fresh admission.
        store.remove(1).unwrap();
        assert!(store.admit(1, bytes(10), session).is_ok());
    }

    #[test]
    fn test_block_larger_than_capacity() {
        let (store, delta) = test_store(1000);
        let err = store.admit(1, bytes(1001), SessionId::new()).unwrap_err();
        assert_eq!(err.bytes_short(), Some(1));
        assert!(delta.is_empty());
        assert_eq!(store.current_usage().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_remove_refused_while_leased() {
        let (store, _) = test_store(1000);
        let session = SessionId::new();
        store.admit(1, bytes(100), session).unwrap();

        let lease = store.acquire(1, LeaseKind::Read, session).await;
        assert_eq!(store.remove(1), Err(StoreError::BlockLocked(1)));

        store.release(lease);
        assert!(store.remove(1).is_ok());
        assert_eq!(store.remove(1), Err(StoreError::BlockNotFound(1)));
        assert_eq!(store.current_usage().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_read_bounds_and_residency() {
        let (store, _) = test_store(1000);
        let session = SessionId::new();
        store
            .admit(1, Bytes::from_static(b"hello world"), session)
            .unwrap();

        let lease = store.acquire(1, LeaseKind::Read, session).await;
        assert_eq!(store.read(&lease, 6, 5).unwrap(), Bytes::from_static(b"world"));
        assert!(matches!(
            store.read(&lease, 6, 6),
            Err(StoreError::OutOfRange { size: 11, .. })
        ));
        assert!(matches!(
            store.read(&lease, u64::MAX, 1),
            Err(StoreError::OutOfRange { .. })
        ));
        store.release(lease);

        let pending = store.begin_write(2, session).await.unwrap();
        let reader = store.acquire(2, LeaseKind::Read, session).await;
        assert_eq!(store.read(&reader, 0, 0), Err(StoreError::BlockNotResident(2)));
        store.release(reader);
        store.release(pending);
    }

    #[tokio::test]
    async fn test_read_requires_live_lease() {
        let (store, _) = test_store(1000);
        let session = SessionId::new();
        store.admit(1, bytes(10), session).unwrap();

        let lease = store.acquire(1, LeaseKind::Read, session).await;
        store.release_session(session);
        assert!(matches!(
            store.read(&lease, 0, 1),
            Err(StoreError::LeaseNotHeld { block_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_block_discarded_when_writer_leaves() {
        let (store, delta) = test_store(1000);
        let session = SessionId::new();

        let lease = store.begin_write(5, session).await.unwrap();
        assert_eq!(store.describe(5).unwrap().state, BlockState::Pending);
        assert_eq!(store.current_usage().used_bytes, 0);

        store.release(lease);
        assert!(store.describe(5).is_none());
        assert!(delta.is_empty());
    }

    #[test]
    fn test_drained_usage_matches_delta() {
        let (store, delta) = test_store(1000);
        let session = SessionId::new();
        store.admit(1, bytes(300), session).unwrap();
        store.admit(2, bytes(200), session).unwrap();

        let (drained, usage) = store.drain_delta();
        let reported: u64 = drained.added().iter().map(|(_, size)| size).sum();
        assert_eq!(usage.used_bytes, reported);
        assert!(delta.is_empty());

        store.remove(1).unwrap();
        let (drained, usage) = store.drain_delta();
        assert_eq!(drained.removed(), vec![1]);
        assert_eq!(usage.used_bytes, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_keeps_lease_alive() {
        let (store, _) = test_store(1000);
        let lease = store.begin_write(1, SessionId::new()).await.unwrap();
        let timeout = Config::default().lease_timeout();

        for _ in 0..3 {
            tokio::time::advance(timeout / 2).await;
            assert!(store.renew(&lease));
        }
        assert_eq!(store.reclaim_expired_leases(), 0);

        tokio::time::advance(timeout + Duration::from_millis(1)).await;
        assert_eq!(store.reclaim_expired_leases(), 1);
        assert!(!store.renew(&lease));
        assert!(store.describe(1).is_none());
    }

    #[tokio::test]
    async fn test_admit_refused_for_foreign_writer() {
        let (store, _) = test_store(1000);
        let writer = SessionId::new();
        let _lease = store.begin_write(5, writer).await.unwrap();

        assert_eq!(
            store.admit(5, bytes(10), SessionId::new()),
            Err(StoreError::BlockLocked(5))
        );
        assert!(store.admit(5, bytes(10), writer).is_ok());
    }
}
