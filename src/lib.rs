//! worker-cache: the storage-tier block cache of a distributed file system worker.
//!
//! Holds blocks in a bounded memory pool, evicts least recently used blocks
//! under pressure, never evicts a block someone is reading or writing, and
//! keeps the master's view of the cache current through periodic heartbeats.

pub mod cache;
pub mod config;
pub mod heartbeat;
pub mod master;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod worker;
