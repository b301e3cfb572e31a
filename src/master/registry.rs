//! In-process master cache registry.
//!
//! Keeps the master's view of which blocks each worker holds, built only from
//! heartbeats. Clients query it for block locations and per-file cache
//! percentages; it is as fresh as the last heartbeat it received.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::block::BlockId;
use crate::master::{FileId, HeartbeatRequest, HeartbeatResponse, MasterClient, MasterError, WorkerId};

/// The master's record of one worker.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    /// Resident blocks and their sizes.
    pub blocks: BTreeMap<BlockId, u64>,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub last_heartbeat: Instant,
    /// Deletes to hand out with the next heartbeat response.
    pending_deletes: Vec<BlockId>,
}

impl WorkerEntry {
    fn new(now: Instant) -> Self {
        Self {
            blocks: BTreeMap::new(),
            used_bytes: 0,
            capacity_bytes: 0,
            last_heartbeat: now,
            pending_deletes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    workers: HashMap<WorkerId, WorkerEntry>,
    files: HashMap<FileId, Vec<(BlockId, u64)>>,
}

/// Master-side block placement registry.
#[derive(Debug, Default)]
pub struct MasterRegistry {
    state: Mutex<RegistryState>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a worker heartbeat and return any queued commands for it.
    pub fn handle_heartbeat(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        let now = Instant::now();
        let mut state = self.state();
        let entry = state.workers.entry(request.worker_id).or_insert_with(|| {
            info!(worker_id = request.worker_id, "Registered worker");
            WorkerEntry::new(now)
        });

        for block_id in &request.removed {
            entry.blocks.remove(block_id);
        }
        for &(block_id, size) in &request.added {
            entry.blocks.insert(block_id, size);
        }
        entry.used_bytes = request.used_bytes;
        entry.capacity_bytes = request.capacity_bytes;
        entry.last_heartbeat = now;

        debug!(
            worker_id = request.worker_id,
            added = request.added.len(),
            removed = request.removed.len(),
            blocks = entry.blocks.len(),
            "Heartbeat applied"
        );

        HeartbeatResponse {
            blocks_to_delete: std::mem::take(&mut entry.pending_deletes),
        }
    }

    /// Ask a worker to drop a block on its next heartbeat.
    pub fn schedule_delete(&self, worker_id: WorkerId, block_id: BlockId) {
        let now = Instant::now();
        self.state()
            .workers
            .entry(worker_id)
            .or_insert_with(|| WorkerEntry::new(now))
            .pending_deletes
            .push(block_id);
    }

    /// Record which blocks make up a file, with their sizes.
    pub fn register_file(&self, file_id: FileId, blocks: Vec<(BlockId, u64)>) {
        self.state().files.insert(file_id, blocks);
    }

    /// Workers currently believed to hold a block, in ID order.
    pub fn block_locations(&self, block_id: BlockId) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self
            .state()
            .workers
            .iter()
            .filter(|(_, entry)| entry.blocks.contains_key(&block_id))
            .map(|(id, _)| *id)
            .collect();
        workers.sort_unstable();
        workers
    }

    /// Percentage of a file's bytes cached on some worker, or `None` if the
    /// file is unknown.
    pub fn cache_percentage(&self, file_id: FileId) -> Option<u8> {
        let state = self.state();
        let blocks = state.files.get(&file_id)?;

        let total: u64 = blocks.iter().map(|(_, size)| size).sum();
        if total == 0 {
            return Some(100);
        }
        let cached: u64 = blocks
            .iter()
            .filter(|(id, _)| state.workers.values().any(|w| w.blocks.contains_key(id)))
            .map(|(_, size)| size)
            .sum();
        Some((cached * 100 / total) as u8)
    }

    /// Blocks the master believes a worker holds.
    pub fn worker_blocks(&self, worker_id: WorkerId) -> Vec<BlockId> {
        self.state()
            .workers
            .get(&worker_id)
            .map(|entry| entry.blocks.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<WorkerEntry> {
        self.state().workers.get(&worker_id).cloned()
    }

    pub fn last_heartbeat(&self, worker_id: WorkerId) -> Option<Instant> {
        self.state()
            .workers
            .get(&worker_id)
            .map(|entry| entry.last_heartbeat)
    }

    /// Workers silent for longer than `timeout`.
    pub fn lost_workers(&self, timeout: Duration) -> Vec<WorkerId> {
        let now = Instant::now();
        let mut lost: Vec<WorkerId> = self
            .state()
            .workers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_heartbeat) > timeout)
            .map(|(id, _)| *id)
            .collect();
        lost.sort_unstable();
        lost
    }
}

#[async_trait]
impl MasterClient for MasterRegistry {
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, MasterError> {
        Ok(self.handle_heartbeat(request))
    }
}
