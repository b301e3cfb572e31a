//! Worker ↔ master protocol.
//!
//! - [`registry`]: in-process master that tracks block placement per worker
//!
//! The worker only ever sends heartbeats; the master answers with commands.
//! Transport is left to whoever implements [`MasterClient`].

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::block::BlockId;

/// Identifies a worker to the master.
pub type WorkerId = u64;

/// Identifies a file in the master's namespace.
pub type FileId = u64;

/// Heartbeat sent by a worker every interval, even when nothing changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,

    /// Blocks that became resident, with their sizes.
    pub added: Vec<(BlockId, u64)>,

    /// Blocks that left the cache.
    pub removed: Vec<BlockId>,

    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Commands the master returns with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Blocks the master wants dropped from this worker's cache.
    #[serde(default)]
    pub blocks_to_delete: Vec<BlockId>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    #[error("Master unreachable: {0}")]
    Unreachable(String),

    #[error("Heartbeat rejected by master: {0}")]
    Rejected(String),
}

/// Anything a worker can send heartbeats to.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, MasterError>;
}
