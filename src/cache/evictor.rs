//! Eviction policy: decides which blocks to drop under capacity pressure.
//!
//! Plain LRU with a hard lock filter:
//! - Only resident blocks with no active lease are candidates
//! - Candidates are ranked by last access, oldest first (ties by block ID)
//! - Victims accumulate until the requested bytes are covered

use crate::cache::block::{AccessStamp, BlockId, CachedBlock};

/// An eviction candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EvictionCandidate {
    // Field order matters: the derived ordering ranks by recency, then by ID.
    pub last_access: AccessStamp,
    pub block_id: BlockId,
    pub size: u64,
}

/// The outcome of a victim selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Victims {
    /// Victims in eviction order (oldest first).
    pub block_ids: Vec<BlockId>,

    /// Total bytes the victims free. May fall short of what was asked for.
    pub bytes: u64,
}

impl Victims {
    /// Whether these victims free at least `required` bytes.
    pub fn covers(&self, required: u64) -> bool {
        self.bytes >= required
    }
}

/// The LRU eviction policy.
#[derive(Debug, Default, Clone)]
pub struct LruEvictor;

impl LruEvictor {
    pub fn new() -> Self {
        Self
    }

    /// Select victims that free at least `required_bytes`.
    ///
    /// `is_locked` is applied before ranking: a leased block is never a
    /// candidate, however cold it is. When the candidates run out first the
    /// returned set is short and the caller decides what a shortfall means.
    pub fn select_victims<'a>(
        &self,
        blocks: impl Iterator<Item = &'a CachedBlock>,
        required_bytes: u64,
        is_locked: impl Fn(BlockId) -> bool,
    ) -> Victims {
        if required_bytes == 0 {
            return Victims::default();
        }

        let mut candidates: Vec<EvictionCandidate> = blocks
            .filter(|block| block.is_resident() && !is_locked(block.id))
            .map(|block| EvictionCandidate {
                last_access: block.last_access,
                block_id: block.id,
                size: block.size,
            })
            .collect();
        candidates.sort_unstable();

        let mut victims = Victims::default();
        for candidate in candidates {
            if victims.covers(required_bytes) {
                break;
            }
            victims.block_ids.push(candidate.block_id);
            victims.bytes += candidate.size;
        }

        victims
    }
}
