//! Worker block cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: block descriptors, the descriptor table, session IDs
//! - [`lock`]: read/write leases that pin blocks against eviction
//! - [`evictor`]: LRU victim selection over unleased blocks
//! - [`store`]: the block store that ties admission, reads and eviction together

pub mod block;
pub mod evictor;
pub mod lock;
pub mod store;
