//! Block descriptors and the block descriptor table.
//!
//! A block is the unit of caching: it is admitted, read, evicted and reported
//! to the master as a whole. The table is pure data; all policy lives in the
//! store, the lock manager and the evictor.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier for a block within a worker.
pub type BlockId = u64;

/// Identifies a client session holding leases against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Residency state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    /// Bytes are still arriving; not charged to the ledger, not readable.
    Pending,
    /// Fully written and charged to the ledger.
    Resident,
    /// Dropped from the cache. Only seen on descriptors handed back after eviction.
    Evicted,
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockState::Pending => write!(f, "pending"),
            BlockState::Resident => write!(f, "resident"),
            BlockState::Evicted => write!(f, "evicted"),
        }
    }
}

/// A point on the store's access clock, in nanoseconds since the store started.
pub type AccessStamp = u64;

/// Strictly monotonic clock used for recency.
///
/// Every reading is at least one tick later than the previous one, so two
/// accesses in quick succession never share a stamp.
#[derive(Debug)]
pub struct AccessClock {
    origin: Instant,
    last: AccessStamp,
}

impl AccessClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: 0,
        }
    }

    /// Take the next reading.
    pub fn tick(&mut self) -> AccessStamp {
        let elapsed = self.origin.elapsed().as_nanos() as AccessStamp;
        self.last = elapsed.max(self.last + 1);
        self.last
    }
}

impl Default for AccessClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata for a single cached block.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    /// Unique identifier for this block.
    pub id: BlockId,

    /// Size in bytes. Zero while pending, fixed once resident.
    pub size: u64,

    /// Current residency state.
    pub state: BlockState,

    /// Last time the block was created or read.
    pub last_access: AccessStamp,

    /// Block contents, present once resident.
    pub data: Option<Bytes>,
}

impl CachedBlock {
    /// Create a descriptor for a block whose bytes are still arriving.
    pub fn pending(id: BlockId, now: AccessStamp) -> Self {
        Self {
            id,
            size: 0,
            state: BlockState::Pending,
            last_access: now,
            data: None,
        }
    }

    /// Create a resident descriptor holding `data`.
    pub fn resident(id: BlockId, data: Bytes, now: AccessStamp) -> Self {
        Self {
            id,
            size: data.len() as u64,
            state: BlockState::Resident,
            last_access: now,
            data: Some(data),
        }
    }

    /// Record an access.
    pub fn touch(&mut self, now: AccessStamp) {
        self.last_access = now;
    }

    pub fn is_resident(&self) -> bool {
        self.state == BlockState::Resident
    }
}

/// Serializable view of a block, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub id: BlockId,
    pub size: u64,
    pub state: BlockState,
    pub last_access: AccessStamp,
    pub lease_count: usize,
}

/// Block descriptor table: block ID → metadata.
#[derive(Debug, Default)]
pub struct BlockTable {
    blocks: HashMap<BlockId, CachedBlock>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BlockId) -> Option<&CachedBlock> {
        self.blocks.get(&id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut CachedBlock> {
        self.blocks.get_mut(&id)
    }

    /// Insert or replace a descriptor.
    pub fn insert(&mut self, block: CachedBlock) -> Option<CachedBlock> {
        self.blocks.insert(block.id, block)
    }

    pub fn remove(&mut self, id: BlockId) -> Option<CachedBlock> {
        self.blocks.remove(&id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Iterate over every descriptor, pending ones included.
    pub fn iter(&self) -> impl Iterator<Item = &CachedBlock> {
        self.blocks.values()
    }

    /// Number of descriptors in the table.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
