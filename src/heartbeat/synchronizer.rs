//! Periodic worker → master heartbeat.
//!
//! Each tick swaps out the pending delta, reports it together with the
//! matching usage, and carries out whatever the master sends back. The send
//! happens with no store lock held. A failed send puts the delta back so the
//! next tick reports it, which widens staleness but never loses or duplicates
//! entries. Master deletes that hit a leased block are kept and retried on
//! later ticks.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::block::BlockId;
use crate::cache::store::{SharedStore, StoreError};
use crate::config::Config;
use crate::heartbeat::delta::DeltaBuffer;
use crate::master::{HeartbeatRequest, HeartbeatResponse, MasterClient, WorkerId};
use crate::metrics::CacheMetrics;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether the master received the heartbeat.
    pub delivered: bool,
    pub added: usize,
    pub removed: usize,
    /// Blocks dropped on the master's instruction.
    pub deleted: Vec<BlockId>,
}

pub struct HeartbeatSynchronizer {
    worker_id: WorkerId,
    interval: Duration,
    store: SharedStore,
    delta: Arc<DeltaBuffer>,
    master: Arc<dyn MasterClient>,
    metrics: CacheMetrics,

    /// Master deletes skipped because the block was leased.
    deferred_deletes: Mutex<BTreeSet<BlockId>>,
}

impl HeartbeatSynchronizer {
    pub fn new(
        config: &Config,
        store: SharedStore,
        delta: Arc<DeltaBuffer>,
        master: Arc<dyn MasterClient>,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            worker_id: config.worker.worker_id,
            interval: config.heartbeat_interval(),
            store,
            delta,
            master,
            metrics,
            deferred_deletes: Mutex::new(BTreeSet::new()),
        }
    }

    fn deferred_deletes(&self) -> MutexGuard<'_, BTreeSet<BlockId>> {
        self.deferred_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one heartbeat. Sent even when nothing changed, so the master can
    /// tell a quiet worker from a lost one.
    pub async fn tick(&self) -> TickReport {
        let (delta, usage) = self.store.drain_delta();

        let request = HeartbeatRequest {
            worker_id: self.worker_id,
            added: delta.added(),
            removed: delta.removed(),
            used_bytes: usage.used_bytes,
            capacity_bytes: usage.capacity_bytes,
        };
        let mut report = TickReport {
            delivered: false,
            added: request.added.len(),
            removed: request.removed.len(),
            deleted: Vec::new(),
        };

        match self.master.heartbeat(request).await {
            Ok(response) => {
                self.metrics.heartbeats_sent.inc();
                debug!(
                    worker_id = self.worker_id,
                    added = report.added,
                    removed = report.removed,
                    "Heartbeat delivered"
                );
                report.delivered = true;
                report.deleted = self.apply(response);
            }
            Err(e) => {
                self.metrics.heartbeat_failures.inc();
                warn!(
                    worker_id = self.worker_id,
                    error = %e,
                    pending = delta.len(),
                    "Heartbeat failed, delta requeued"
                );
                self.delta.requeue(delta);
            }
        }

        report
    }

    /// Carry out the master's commands, plus any deletes still deferred.
    /// Returns the blocks actually removed.
    fn apply(&self, response: HeartbeatResponse) -> Vec<BlockId> {
        let mut requested = std::mem::take(&mut *self.deferred_deletes());
        requested.extend(response.blocks_to_delete);

        let mut deleted = Vec::new();
        let mut still_leased = Vec::new();
        for block_id in requested {
            match self.store.remove(block_id) {
                Ok(_) => {
                    info!(block_id, "Removed block on master request");
                    deleted.push(block_id);
                }
                Err(StoreError::BlockLocked(_)) => {
                    warn!(block_id, "Master delete deferred, block is leased");
                    still_leased.push(block_id);
                }
                Err(StoreError::BlockNotFound(_)) => {
                    debug!(block_id, "Master delete for unknown block ignored");
                }
                Err(e) => {
                    warn!(block_id, error = %e, "Master delete failed");
                }
            }
        }
        self.deferred_deletes().extend(still_leased);
        deleted
    }

    /// Run heartbeats on the configured interval until `shutdown` fires,
    /// then send a final one.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                worker_id = self.worker_id,
                interval_ms = self.interval.as_millis() as u64,
                "Heartbeat synchronizer started"
            );

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.cancelled() => {
                        let report = self.tick().await;
                        if !report.delivered {
                            warn!("Final heartbeat not delivered");
                        }
                        break;
                    }
                }
            }

            info!(worker_id = self.worker_id, "Heartbeat synchronizer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::SessionId;
    use crate::cache::store::new_shared_store;
    use crate::master::registry::MasterRegistry;
    use crate::master::MasterError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` heartbeats, then forwards to a registry.
    struct FlakyMaster {
        registry: MasterRegistry,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl MasterClient for FlakyMaster {
        async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, MasterError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MasterError::Unreachable("connection refused".to_string()));
            }
            Ok(self.registry.handle_heartbeat(request))
        }
    }

    fn setup(master: Arc<dyn MasterClient>) -> (SharedStore, HeartbeatSynchronizer) {
        let mut config = Config::default();
        config.worker.worker_id = 9;
        config.worker.capacity_bytes = 10_000;
        let config = Arc::new(config);
        let delta = Arc::new(DeltaBuffer::new());
        let metrics = CacheMetrics::new().unwrap();
        let store = new_shared_store(config.clone(), delta.clone(), metrics.clone());
        let sync = HeartbeatSynchronizer::new(&config, store.clone(), delta, master, metrics);
        (store, sync)
    }

    #[tokio::test]
    async fn test_tick_reports_delta() {
        let registry = Arc::new(MasterRegistry::new());
        let (store, sync) = setup(registry.clone());

        store.admit(1, Bytes::from(vec![0u8; 100]), SessionId::new()).unwrap();
        assert!(registry.block_locations(1).is_empty());

        let report = sync.tick().await;
        assert!(report.delivered);
        assert_eq!(report.added, 1);
        assert_eq!(registry.block_locations(1), vec![9]);
        assert_eq!(registry.worker(9).unwrap().used_bytes, 100);
    }

    #[tokio::test]
    async fn test_empty_tick_still_sent() {
        let registry = Arc::new(MasterRegistry::new());
        let (_store, sync) = setup(registry.clone());

        let report = sync.tick().await;
        assert!(report.delivered);
        assert!(registry.last_heartbeat(9).is_some());
    }

    #[tokio::test]
    async fn test_failed_tick_requeues() {
        let master = Arc::new(FlakyMaster {
            registry: MasterRegistry::new(),
            failures: AtomicUsize::new(1),
        });
        let (store, sync) = setup(master.clone());
        let session = SessionId::new();

        store.admit(1, Bytes::from(vec![0u8; 100]), session).unwrap();
        store.admit(2, Bytes::from(vec![0u8; 100]), session).unwrap();
        assert!(!sync.tick().await.delivered);

        // During the outage block 2 comes and goes, block 3 arrives.
        store.remove(2).unwrap();
        store.admit(3, Bytes::from(vec![0u8; 100]), session).unwrap();

        let report = sync.tick().await;
        assert!(report.delivered);
        assert_eq!(report.removed, 0);
        assert_eq!(master.registry.worker_blocks(9), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_master_delete_skips_leased_block() {
        let registry = Arc::new(MasterRegistry::new());
        let (store, sync) = setup(registry.clone());
        let session = SessionId::new();

        store.admit(1, Bytes::from(vec![0u8; 10]), session).unwrap();
        store.admit(2, Bytes::from(vec![0u8; 10]), session).unwrap();
        sync.tick().await;

        let lease = store
            .acquire(1, crate::cache::lock::LeaseKind::Read, session)
            .await;
        registry.schedule_delete(9, 1);
        registry.schedule_delete(9, 2);
        registry.schedule_delete(9, 77);

        let report = sync.tick().await;
        assert_eq!(report.deleted, vec![2]);
        assert!(store.is_resident(1));
        assert!(!store.is_resident(2));

        // Retried once the lease is gone, without the master asking again.
        store.release(lease);
        let report = sync.tick().await;
        assert_eq!(report.deleted, vec![1]);
        assert!(!store.is_resident(1));

        sync.tick().await;
        assert!(registry.worker_blocks(9).is_empty());
    }

    #[tokio::test]
    async fn test_reported_usage_matches_reported_blocks() {
        let registry = Arc::new(MasterRegistry::new());
        let (store, sync) = setup(registry.clone());
        let session = SessionId::new();

        store.admit(1, Bytes::from(vec![0u8; 300]), session).unwrap();
        store.admit(2, Bytes::from(vec![0u8; 400]), session).unwrap();
        sync.tick().await;

        let entry = registry.worker(9).unwrap();
        let reported: u64 = entry.blocks.values().sum();
        assert_eq!(entry.used_bytes, reported);
    }
}
