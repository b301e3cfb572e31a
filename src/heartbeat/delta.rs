//! Block deltas accumulated between heartbeats.
//!
//! Each block ID carries its net change relative to what the master last
//! heard. Composing changes keeps the report free of duplicates: a block
//! added and removed inside one window never reaches the master, and a block
//! removed and re-added is reported once as an upsert.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::block::BlockId;

/// Net change for one block since the last reported heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// Unknown to the master, now resident.
    Added(u64),
    /// Known to the master, now gone.
    Removed,
    /// Known to the master, dropped and admitted again.
    Replaced(u64),
}

/// Added/removed blocks since the previous heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDelta {
    changes: BTreeMap<BlockId, Change>,
}

impl BlockDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a block became resident with the given size.
    pub fn record_added(&mut self, block_id: BlockId, size: u64) {
        let next = match self.changes.get(&block_id) {
            Some(Change::Removed) | Some(Change::Replaced(_)) => Change::Replaced(size),
            Some(Change::Added(_)) | None => Change::Added(size),
        };
        self.changes.insert(block_id, next);
    }

    /// Record that a block left the cache.
    pub fn record_removed(&mut self, block_id: BlockId) {
        match self.changes.get(&block_id) {
            Some(Change::Added(_)) => {
                self.changes.remove(&block_id);
            }
            _ => {
                self.changes.insert(block_id, Change::Removed);
            }
        }
    }

    /// Fold a newer delta on top of this one.
    pub fn merge(&mut self, newer: BlockDelta) {
        for (block_id, change) in newer.changes {
            match change {
                Change::Added(size) => self.record_added(block_id, size),
                Change::Removed => self.record_removed(block_id),
                Change::Replaced(size) => {
                    self.record_removed(block_id);
                    self.record_added(block_id, size);
                }
            }
        }
    }

    /// Blocks to report as added, with sizes, in block ID order.
    pub fn added(&self) -> Vec<(BlockId, u64)> {
        self.changes
            .iter()
            .filter_map(|(id, change)| match change {
                Change::Added(size) | Change::Replaced(size) => Some((*id, *size)),
                Change::Removed => None,
            })
            .collect()
    }

    /// Blocks to report as removed, in block ID order.
    pub fn removed(&self) -> Vec<BlockId> {
        self.changes
            .iter()
            .filter(|(_, change)| matches!(change, Change::Removed))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Shared delta the store appends to and the synchronizer drains.
///
/// Guarded by its own short-lived lock, separate from the store's, so a
/// heartbeat never waits on cache traffic beyond the swap itself.
#[derive(Debug, Default)]
pub struct DeltaBuffer {
    inner: Mutex<BlockDelta>,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BlockDelta> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_added(&self, block_id: BlockId, size: u64) {
        self.lock().record_added(block_id, size);
    }

    pub fn record_removed(&self, block_id: BlockId) {
        self.lock().record_removed(block_id);
    }

    /// Swap the accumulated delta for an empty one.
    pub fn take(&self) -> BlockDelta {
        std::mem::take(&mut *self.lock())
    }

    /// Put back a delta that could not be delivered.
    ///
    /// It is older than anything recorded since it was taken, so it goes
    /// underneath.
    pub fn requeue(&self, older: BlockDelta) {
        let mut guard = self.lock();
        let newer = std::mem::replace(&mut *guard, older);
        guard.merge(newer);
    }

    /// Copy of the pending delta.
    pub fn snapshot(&self) -> BlockDelta {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
