//! Local file system under-storage.
//!
//! Each block is one file. A two-level layout keeps directories small:
//! block 12345 → `<root>/12/12345.block`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::cache::block::BlockId;
use crate::storage::{UnderStorage, UnderStorageError};

/// I/O counters.
#[derive(Debug, Default)]
pub struct UnderStorageStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

/// Under-storage rooted at a local directory.
#[derive(Debug)]
pub struct LocalUnderStorage {
    root: PathBuf,
    stats: UnderStorageStats,
}

impl LocalUnderStorage {
    /// Open (and create if needed) under-storage at `root`.
    pub async fn new(root: PathBuf) -> Result<Self, UnderStorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats: UnderStorageStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for a block.
    fn block_path(&self, block_id: BlockId) -> PathBuf {
        let shard = block_id / 1000;
        self.root
            .join(format!("{shard}"))
            .join(format!("{block_id}.block"))
    }

    pub fn stats(&self) -> &UnderStorageStats {
        &self.stats
    }
}

#[async_trait]
impl UnderStorage for LocalUnderStorage {
    async fn persist(&self, block_id: BlockId, data: Bytes) -> Result<(), UnderStorageError> {
        let path = self.block_path(block_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&path, &data).await?;

        debug!(
            block_id,
            path = %path.display(),
            size = data.len(),
            "Persisted block"
        );

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn fetch(&self, block_id: BlockId) -> Result<Bytes, UnderStorageError> {
        let path = self.block_path(block_id);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UnderStorageError::BlockNotFound { block_id, path });
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            block_id,
            path = %path.display(),
            size = data.len(),
            "Fetched block from under-storage"
        );

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(Bytes::from(data))
    }

    async fn delete(&self, block_id: BlockId) -> Result<(), UnderStorageError> {
        let path = self.block_path(block_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(block_id, path = %path.display(), "Deleted block file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
