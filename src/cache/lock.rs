//! Lease bookkeeping for blocks.
//!
//! A lease pins a block: while any lease is outstanding the block can neither
//! be evicted nor removed. Read leases are shared; a write lease excludes
//! other writers on the same block. The manager itself is plain data and is
//! only ever mutated under the store's lock, which keeps "is it locked?" and
//! "evict it" in the same critical section.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::block::{BlockId, SessionId};

/// Unique identifier for a lease.
pub type LeaseId = u64;

/// The kind of access a lease grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseKind {
    Read,
    Write,
}

impl std::fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseKind::Read => write!(f, "read"),
            LeaseKind::Write => write!(f, "write"),
        }
    }
}

/// Handle to a granted lease.
///
/// Deliberately not `Clone`: a lease is released exactly once, by whoever owns
/// the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    id: LeaseId,
    block_id: BlockId,
    kind: LeaseKind,
    session: SessionId,
}

impl Lease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

/// A lease dropped by the manager rather than by its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedLease {
    pub lease_id: LeaseId,
    pub block_id: BlockId,
    pub kind: LeaseKind,
    pub session: SessionId,
}

#[derive(Debug)]
struct LeaseRecord {
    block_id: BlockId,
    kind: LeaseKind,
    session: SessionId,
    last_active: Instant,
}

/// Tracks active leases per block.
#[derive(Debug, Default)]
pub struct LockManager {
    next_id: LeaseId,
    leases: HashMap<LeaseId, LeaseRecord>,
    by_block: HashMap<BlockId, HashSet<LeaseId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a lease unless it would conflict with an outstanding write lease.
    ///
    /// Read leases always succeed. A write lease returns `None` while another
    /// write lease on the same block is active; the caller waits for a release
    /// and tries again.
    pub fn try_acquire(
        &mut self,
        block_id: BlockId,
        kind: LeaseKind,
        session: SessionId,
        now: Instant,
    ) -> Option<Lease> {
        if kind == LeaseKind::Write && self.writer(block_id).is_some() {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        self.leases.insert(
            id,
            LeaseRecord {
                block_id,
                kind,
                session,
                last_active: now,
            },
        );
        self.by_block.entry(block_id).or_default().insert(id);

        Some(Lease {
            id,
            block_id,
            kind,
            session,
        })
    }

    /// Release a lease. Returns false if it was already gone (e.g. reclaimed).
    pub fn release(&mut self, lease: &Lease) -> bool {
        self.drop_lease(lease.id).is_some()
    }

    /// Whether the lease is still outstanding.
    pub fn is_active(&self, lease: &Lease) -> bool {
        self.leases
            .get(&lease.id)
            .is_some_and(|record| record.block_id == lease.block_id)
    }

    /// Mark a lease as recently used so the timeout sweep leaves it alone.
    pub fn renew(&mut self, lease: &Lease, now: Instant) -> bool {
        match self.leases.get_mut(&lease.id) {
            Some(record) => {
                record.last_active = now;
                true
            }
            None => false,
        }
    }

    /// A block is locked iff it has at least one active lease.
    pub fn is_locked(&self, block_id: BlockId) -> bool {
        self.by_block
            .get(&block_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn lease_count(&self, block_id: BlockId) -> usize {
        self.by_block.get(&block_id).map_or(0, HashSet::len)
    }

    /// The session holding the write lease on a block, if any.
    pub fn writer(&self, block_id: BlockId) -> Option<SessionId> {
        self.by_block.get(&block_id)?.iter().find_map(|id| {
            self.leases
                .get(id)
                .filter(|record| record.kind == LeaseKind::Write)
                .map(|record| record.session)
        })
    }

    /// Drop every lease held by `session`.
    pub fn release_session(&mut self, session: SessionId) -> Vec<ReclaimedLease> {
        let ids: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.session == session)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.drop_lease(id)).collect()
    }

    /// Drop every lease idle for longer than `timeout`.
    pub fn reclaim_expired(&mut self, now: Instant, timeout: Duration) -> Vec<ReclaimedLease> {
        let ids: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_active) > timeout)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.drop_lease(id)).collect()
    }

    /// Total number of outstanding leases.
    pub fn active_leases(&self) -> usize {
        self.leases.len()
    }

    fn drop_lease(&mut self, id: LeaseId) -> Option<ReclaimedLease> {
        let record = self.leases.remove(&id)?;
        if let Some(ids) = self.by_block.get_mut(&record.block_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_block.remove(&record.block_id);
            }
        }
        Some(ReclaimedLease {
            lease_id: id,
            block_id: record.block_id,
            kind: record.kind,
            session: record.session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_leases_are_shared() {
        let mut locks = LockManager::new();
        let now = Instant::now();
        let a = locks.try_acquire(1, LeaseKind::Read, SessionId::new(), now).unwrap();
        let b = locks.try_acquire(1, LeaseKind::Read, SessionId::new(), now).unwrap();

        assert_eq!(locks.lease_count(1), 2);
        assert!(locks.release(&a));
        assert!(locks.is_locked(1));
        assert!(locks.release(&b));
        assert!(!locks.is_locked(1));
    }

    #[test]
    fn test_write_lease_excludes_other_writers() {
        let mut locks = LockManager::new();
        let now = Instant::now();
        let writer = SessionId::new();
        let lease = locks.try_acquire(1, LeaseKind::Write, writer, now).unwrap();

        assert_eq!(locks.writer(1), Some(writer));
        assert!(locks.try_acquire(1, LeaseKind::Write, SessionId::new(), now).is_none());
        // Other blocks and readers are unaffected.
        assert!(locks.try_acquire(2, LeaseKind::Write, SessionId::new(), now).is_some());
        assert!(locks.try_acquire(1, LeaseKind::Read, SessionId::new(), now).is_some());

        locks.release(&lease);
        assert!(locks.try_acquire(1, LeaseKind::Write, SessionId::new(), now).is_some());
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut locks = LockManager::new();
        let lease = locks
            .try_acquire(3, LeaseKind::Read, SessionId::new(), Instant::now())
            .unwrap();
        assert!(locks.release(&lease));
        assert!(!locks.release(&lease));
        assert!(!locks.is_active(&lease));
    }

    #[test]
    fn test_release_session() {
        let mut locks = LockManager::new();
        let now = Instant::now();
        let crashed = SessionId::new();
        let alive = SessionId::new();
        locks.try_acquire(1, LeaseKind::Read, crashed, now);
        locks.try_acquire(2, LeaseKind::Write, crashed, now);
        locks.try_acquire(1, LeaseKind::Read, alive, now);

        let released = locks.release_session(crashed);
        assert_eq!(released.len(), 2);
        assert!(locks.is_locked(1));
        assert!(!locks.is_locked(2));
        assert_eq!(locks.active_leases(), 1);
    }

    #[test]
    fn test_reclaim_expired_respects_renewal() {
        let mut locks = LockManager::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let stale = locks.try_acquire(1, LeaseKind::Read, SessionId::new(), start).unwrap();
        let busy = locks.try_acquire(2, LeaseKind::Read, SessionId::new(), start).unwrap();

        locks.renew(&busy, start + Duration::from_secs(8));
        let reclaimed = locks.reclaim_expired(start + Duration::from_secs(11), timeout);

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].lease_id, stale.id());
        assert!(!locks.is_locked(1));
        assert!(locks.is_locked(2));
    }
}
