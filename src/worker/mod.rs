//! Worker facade: what clients talk to.
//!
//! - [`stream`]: block in/out streams holding leases for their lifetime
//!
//! Ties the block store to under-storage: writes can go to the cache, to
//! under-storage or both, and reads of non-resident blocks are served from
//! under-storage (and optionally cached on the way through).

pub mod stream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::block::{BlockId, BlockState, SessionId};
use crate::cache::lock::LeaseKind;
use crate::cache::store::{new_shared_store, SharedStore, StoreError};
use crate::config::Config;
use crate::heartbeat::delta::DeltaBuffer;
use crate::heartbeat::synchronizer::HeartbeatSynchronizer;
use crate::master::MasterClient;
use crate::metrics::CacheMetrics;
use crate::storage::{UnderStorage, UnderStorageError};
use crate::worker::stream::{BlockInStream, BlockOutStream};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    UnderStorage(#[from] UnderStorageError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Write to block {0} would be discarded: neither caching nor persistence requested")]
    DiscardedWrite(BlockId),
}

/// Whether a stream should place data in the worker cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    Cache,
    NoCache,
}

/// Whether a write should also go to under-storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnderStorageType {
    Persist,
    NoPersist,
}

/// Per-stream client options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    pub cache_type: CacheType,
    pub under_storage_type: UnderStorageType,
}

impl ClientOptions {
    /// Cache and persist.
    pub fn write_both() -> Self {
        Self {
            cache_type: CacheType::Cache,
            under_storage_type: UnderStorageType::Persist,
        }
    }

    /// Persist only, bypassing the cache.
    pub fn under_storage_only() -> Self {
        Self {
            cache_type: CacheType::NoCache,
            under_storage_type: UnderStorageType::Persist,
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Cache,
            under_storage_type: UnderStorageType::NoPersist,
        }
    }
}

/// How a completed write ended up stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The block is resident in the cache.
    Cached {
        persisted: bool,
        /// Blocks evicted to make room, oldest first.
        evicted: Vec<BlockId>,
    },

    /// The block lives only in under-storage.
    ///
    /// `bytes_short` is set when caching was requested but there was not
    /// enough evictable space.
    UnderStorageOnly { bytes_short: Option<u64> },
}

/// A worker's cache plus its collaborators.
pub struct Worker {
    config: Arc<Config>,
    store: SharedStore,
    delta: Arc<DeltaBuffer>,
    under_storage: Arc<dyn UnderStorage>,
    metrics: CacheMetrics,
}

impl Worker {
    pub fn new(config: Arc<Config>, under_storage: Arc<dyn UnderStorage>) -> Result<Self, WorkerError> {
        let delta = Arc::new(DeltaBuffer::new());
        let metrics = CacheMetrics::new()?;
        let store = new_shared_store(config.clone(), delta.clone(), metrics.clone());

        info!(
            worker_id = config.worker.worker_id,
            capacity_bytes = config.worker.capacity_bytes,
            "Worker cache initialized"
        );

        Ok(Self {
            config,
            store,
            delta,
            under_storage,
            metrics,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Build the heartbeat task that reports this worker's cache to `master`.
    pub fn heartbeat_synchronizer(&self, master: Arc<dyn MasterClient>) -> HeartbeatSynchronizer {
        HeartbeatSynchronizer::new(
            &self.config,
            self.store.clone(),
            self.delta.clone(),
            master,
            self.metrics.clone(),
        )
    }

    /// Open a stream that writes a new block.
    ///
    /// When caching, the stream holds the block's write lease and the block
    /// is pending until the stream is closed.
    pub async fn create_block(
        &self,
        block_id: BlockId,
        session: SessionId,
        options: ClientOptions,
    ) -> Result<BlockOutStream, WorkerError> {
        let lease = match (options.cache_type, options.under_storage_type) {
            (CacheType::NoCache, UnderStorageType::NoPersist) => {
                return Err(WorkerError::DiscardedWrite(block_id));
            }
            (CacheType::Cache, _) => Some(self.store.begin_write(block_id, session).await?),
            (CacheType::NoCache, _) => None,
        };

        debug!(block_id, %session, ?options, "Opened block for writing");
        Ok(BlockOutStream::new(
            block_id,
            session,
            options,
            lease,
            self.store.clone(),
            self.under_storage.clone(),
        ))
    }

    /// Open a stream that reads a block.
    ///
    /// A resident block is read from the cache under a read lease. Otherwise
    /// the bytes come from under-storage and, with `CacheType::Cache`, are
    /// admitted on the way through if there is room.
    pub async fn open_block(
        &self,
        block_id: BlockId,
        session: SessionId,
        options: ClientOptions,
    ) -> Result<BlockInStream, WorkerError> {
        let lease = self.store.acquire(block_id, LeaseKind::Read, session).await;

        // Holding the lease, a resident block stays resident.
        if let Some(size) = self
            .store
            .describe(block_id)
            .filter(|block| block.state == BlockState::Resident)
            .map(|block| block.size)
        {
            debug!(block_id, %session, size, "Opened cached block for reading");
            return Ok(BlockInStream::cached(block_id, size, lease, self.store.clone()));
        }
        self.store.release(lease);

        let data = self.under_storage.fetch(block_id).await?;
        if options.cache_type == CacheType::Cache {
            match self.store.admit(block_id, data.clone(), session) {
                Ok(admission) => {
                    debug!(
                        block_id,
                        size = admission.size,
                        evicted = admission.evicted.len(),
                        "Cached block on read"
                    );
                }
                Err(StoreError::InsufficientSpace { .. }) => {
                    debug!(block_id, "No room to cache block on read, serving from under-storage");
                }
                Err(StoreError::BlockAlreadyExists(_)) | Err(StoreError::BlockLocked(_)) => {
                    // Another session is writing or just cached it.
                }
                Err(e) => {
                    warn!(block_id, error = %e, "Read-through admission failed");
                }
            }
        }

        debug!(block_id, %session, size = data.len(), "Opened block from under-storage");
        Ok(BlockInStream::uncached(block_id, data))
    }

    /// Delete a block from the cache and from under-storage.
    ///
    /// Refused with `BlockLocked` while any lease is outstanding; in that case
    /// under-storage is left untouched.
    pub async fn delete_block(&self, block_id: BlockId) -> Result<(), WorkerError> {
        match self.store.remove(block_id) {
            Ok(_) | Err(StoreError::BlockNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.under_storage.delete(block_id).await?;
        info!(block_id, "Deleted block");
        Ok(())
    }

    /// Release every lease held by a session, e.g. after its client vanished.
    pub fn close_session(&self, session: SessionId) -> usize {
        self.store.release_session(session)
    }

    /// Periodically reclaim leases whose holders stopped renewing them.
    pub fn spawn_lease_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let period = self.config.lease_sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reclaimed = store.reclaim_expired_leases();
                        if reclaimed > 0 {
                            info!(reclaimed, "Lease sweep reclaimed expired leases");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Lease reaper stopped");
        })
    }
}
