//! Under-storage: the durable store behind the cache.
//!
//! - [`local`]: blocks as files on a local (or mounted) file system
//!
//! The cache never depends on under-storage for its own decisions; it is only
//! written when a client asks for persistence and read when a block is not
//! resident.

pub mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::block::BlockId;

#[derive(Error, Debug)]
pub enum UnderStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block {block_id} not found in under-storage at {path}")]
    BlockNotFound { block_id: BlockId, path: PathBuf },
}

/// Durable block storage.
#[async_trait]
pub trait UnderStorage: Send + Sync {
    /// Write a block's bytes durably.
    async fn persist(&self, block_id: BlockId, data: Bytes) -> Result<(), UnderStorageError>;

    /// Read a block's bytes back.
    async fn fetch(&self, block_id: BlockId) -> Result<Bytes, UnderStorageError>;

    /// Delete a block. Deleting an absent block is not an error.
    async fn delete(&self, block_id: BlockId) -> Result<(), UnderStorageError>;
}
