//! Block streams.
//!
//! A stream owns its lease: opening takes it, `close` or drop gives it back,
//! so an abandoned stream cannot pin a block past its own lifetime.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::cache::block::{BlockId, SessionId};
use crate::cache::lock::Lease;
use crate::cache::store::{SharedStore, StoreError};
use crate::storage::UnderStorage;
use crate::worker::{CacheType, ClientOptions, UnderStorageType, WorkerError, WriteOutcome};

/// Writes one block. Nothing reaches the cache or under-storage until `close`.
pub struct BlockOutStream {
    block_id: BlockId,
    session: SessionId,
    options: ClientOptions,
    buf: BytesMut,
    lease: Option<Lease>,
    store: SharedStore,
    under_storage: Arc<dyn UnderStorage>,
}

impl BlockOutStream {
    pub(crate) fn new(
        block_id: BlockId,
        session: SessionId,
        options: ClientOptions,
        lease: Option<Lease>,
        store: SharedStore,
        under_storage: Arc<dyn UnderStorage>,
    ) -> Self {
        Self {
            block_id,
            session,
            options,
            buf: BytesMut::new(),
            lease,
            store,
            under_storage,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Buffer bytes. Each write renews the stream's write lease.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.renew_lease();
    }

    pub fn bytes_written(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Finish the block: persist if asked, then admit if caching.
    ///
    /// Persistence and admission are independent. A persist failure is
    /// reported even when the block was cached; an admission that runs out of
    /// space falls back to under-storage when the block was persisted and is
    /// an error otherwise.
    pub async fn close(mut self) -> Result<WriteOutcome, WorkerError> {
        let data = std::mem::take(&mut self.buf).freeze();

        let persisted = match self.options.under_storage_type {
            UnderStorageType::Persist => Some(
                self.under_storage
                    .persist(self.block_id, data.clone())
                    .await,
            ),
            UnderStorageType::NoPersist => None,
        };
        let persisted_ok = matches!(persisted, Some(Ok(())));

        // Persisting may have outlasted the lease timeout.
        self.renew_lease();
        let cached = match self.options.cache_type {
            CacheType::Cache => Some(self.store.admit(self.block_id, data, self.session)),
            CacheType::NoCache => None,
        };

        if let Some(lease) = self.lease.take() {
            self.store.release(lease);
        }

        if let Some(Err(e)) = persisted {
            warn!(block_id = self.block_id, error = %e, "Persist failed");
            return Err(e.into());
        }

        match cached {
            Some(Ok(admission)) => Ok(WriteOutcome::Cached {
                persisted: persisted_ok,
                evicted: admission.evicted.iter().map(|block| block.id).collect(),
            }),
            Some(Err(e @ StoreError::InsufficientSpace { .. })) if persisted_ok => {
                warn!(
                    block_id = self.block_id,
                    error = %e,
                    "Block not cached, kept in under-storage only"
                );
                Ok(WriteOutcome::UnderStorageOnly {
                    bytes_short: e.bytes_short(),
                })
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(WriteOutcome::UnderStorageOnly { bytes_short: None }),
        }
    }

    fn renew_lease(&self) {
        if let Some(lease) = &self.lease {
            if !self.store.renew(lease) {
                warn!(block_id = self.block_id, "Write lease was reclaimed");
            }
        }
    }
}

impl Drop for BlockOutStream {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            debug!(block_id = self.block_id, "Write stream dropped without close");
            self.store.release(lease);
        }
    }
}

enum Source {
    Cache { lease: Lease, store: SharedStore },
    UnderStorage(Bytes),
}

/// Reads one block, from the cache under a read lease or from bytes fetched
/// out of under-storage.
pub struct BlockInStream {
    block_id: BlockId,
    size: u64,
    pos: u64,
    source: Option<Source>,
}

impl BlockInStream {
    pub(crate) fn cached(block_id: BlockId, size: u64, lease: Lease, store: SharedStore) -> Self {
        Self {
            block_id,
            size,
            pos: 0,
            source: Some(Source::Cache { lease, store }),
        }
    }

    pub(crate) fn uncached(block_id: BlockId, data: Bytes) -> Self {
        Self {
            block_id,
            size: data.len() as u64,
            pos: 0,
            source: Some(Source::UnderStorage(data)),
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.pos
    }

    /// Whether reads are served by the cache.
    pub fn is_cached(&self) -> bool {
        matches!(self.source, Some(Source::Cache { .. }))
    }

    /// Read up to `buf.len()` bytes at the current position. Returns 0 at the
    /// end of the block.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, WorkerError> {
        let length = (buf.len() as u64).min(self.remaining());
        if length == 0 {
            return Ok(0);
        }

        let chunk = match &self.source {
            Some(Source::Cache { lease, store }) => store.read(lease, self.pos, length)?,
            Some(Source::UnderStorage(data)) => {
                data.slice(self.pos as usize..(self.pos + length) as usize)
            }
            None => return Err(StoreError::BlockNotFound(self.block_id).into()),
        };

        buf[..chunk.len()].copy_from_slice(&chunk);
        self.pos += chunk.len() as u64;
        Ok(chunk.len())
    }

    /// Move the read position. Seeking to the end is allowed; past it is not.
    pub fn seek(&mut self, pos: u64) -> Result<(), WorkerError> {
        if pos > self.size {
            return Err(StoreError::OutOfRange {
                block_id: self.block_id,
                offset: pos,
                length: 0,
                size: self.size,
            }
            .into());
        }
        self.pos = pos;
        Ok(())
    }

    /// Release the stream's lease.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(Source::Cache { lease, store }) = self.source.take() {
            store.release(lease);
        }
    }
}

impl Drop for BlockInStream {
    fn drop(&mut self) {
        self.release();
    }
}
