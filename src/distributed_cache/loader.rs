//! Ranged reads into pooled blocks
//!
//! A load splits a byte range into block-sized pieces, takes one block per
//! piece from the pool and hands each to the worker pool, which fills it from
//! the store. Filled blocks arrive on a channel in completion order.
//!
//! ```text
//!  load(path, off, len)
//!     │ feeder task: get_block() per piece (waits while the pool is empty)
//!     ▼
//!  WorkerPool ──▶ read_buffer(path, piece) ──▶ copy into block ──▶ receiver
//! ```
//!
//! The caller owns every block it receives and must give it back with
//! `BlockPool::release_block`; a load larger than the pool only makes
//! progress while the caller keeps releasing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::block_pool::{Block, BlockPool};
use crate::error::{Error, Result};
use crate::storage::ObjectStore;
use crate::worker_pool::WorkerPool;

/// Application info attached to every loaded block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Store path the block was read from
    pub object: String,
    /// Index of the piece within the load
    pub index: u64,
}

/// A loaded block, or the reason its piece could not be read
pub type LoadResult = Result<Block<ChunkInfo>>;

struct LoadRequest {
    path: String,
    block: Block<ChunkInfo>,
    reply: mpsc::Sender<LoadResult>,
}

/// Fills pooled blocks from an object store using a worker pool.
pub struct BlockLoader {
    store: Arc<dyn ObjectStore>,
    pool: Arc<BlockPool<ChunkInfo>>,
    workers: Arc<WorkerPool<LoadRequest>>,
}

impl BlockLoader {
    /// Create a loader with `workers` reader tasks. Must be called from
    /// within a tokio runtime.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        pool: Arc<BlockPool<ChunkInfo>>,
        workers: usize,
    ) -> Result<Self> {
        let reader_store = Arc::clone(&store);
        let reader_pool = Arc::clone(&pool);
        let workers = WorkerPool::new(workers, move |request: LoadRequest| {
            let store = Arc::clone(&reader_store);
            let pool = Arc::clone(&reader_pool);
            async move { fill_block(store.as_ref(), pool.as_ref(), request).await }
        })?;
        workers.start()?;

        Ok(Self {
            store,
            pool,
            workers: Arc::new(workers),
        })
    }

    pub fn pool(&self) -> &Arc<BlockPool<ChunkInfo>> {
        &self.pool
    }

    /// Start loading `length` bytes of `path` from `offset`. A `length` of 0
    /// loads to the end of the object.
    #[instrument(skip(self))]
    pub async fn load(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<mpsc::Receiver<LoadResult>> {
        let length = if length == 0 {
            let size = self.store.object_size(path).await?;
            size.saturating_sub(offset)
        } else {
            length
        };
        let end = offset.checked_add(length).ok_or_else(|| {
            Error::Store(format!(
                "range {}+{} of {} overflows",
                offset, length, path
            ))
        })?;

        let block_size = self.pool.block_size();
        let pieces = length.div_ceil(block_size);
        let capacity = usize::try_from(pieces).unwrap_or(usize::MAX).clamp(1, 1024);
        let (tx, rx) = mpsc::channel(capacity);

        debug!(pieces, block_size, "Scheduling block load");

        let pool = Arc::clone(&self.pool);
        let workers = Arc::clone(&self.workers);
        let path = path.to_string();

        tokio::spawn(async move {
            for index in 0..pieces {
                if tx.is_closed() {
                    debug!(path = %path, "Load abandoned by caller");
                    return;
                }

                let acquire_pool = Arc::clone(&pool);
                let acquired = tokio::task::spawn_blocking(move || acquire_pool.get_block())
                    .await
                    .map_err(|e| Error::Internal(format!("block acquisition failed: {}", e)))
                    .and_then(|r| r);
                let mut block = match acquired {
                    Ok(block) => block,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let piece_offset = offset + index * block_size;
                let piece_length = std::cmp::min(block_size, end - piece_offset);
                block.set_name(path.clone());
                block.set_id(index.to_string());
                block.set_range(piece_offset, piece_length);
                block.set_app_info(ChunkInfo {
                    object: path.clone(),
                    index,
                });

                let request = LoadRequest {
                    path: path.clone(),
                    block,
                    reply: tx.clone(),
                };
                if let Err(e) = workers.schedule(request).await {
                    warn!(path = %path, "Cannot schedule block load: {}", e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Stop the readers after every scheduled piece has been delivered.
    pub async fn shutdown(&self) -> Result<()> {
        self.workers.stop().await
    }
}

async fn fill_block(
    store: &dyn ObjectStore,
    pool: &BlockPool<ChunkInfo>,
    request: LoadRequest,
) -> Result<()> {
    let LoadRequest {
        path,
        mut block,
        reply,
    } = request;

    let read = store
        .read_buffer(&path, block.offset(), block.length())
        .await;

    let data = match read {
        Ok(data) => data,
        Err(e) => {
            let reason = e.to_string();
            if let Err(release) = pool.release_block(block) {
                warn!("Failed to return block after read error: {}", release);
            }
            let _ = reply.send(Err(e)).await;
            return Err(Error::Store(format!("read of {} failed: {}", path, reason)));
        }
    };

    let n = std::cmp::min(data.len(), block.capacity());
    block.data_mut()[..n].copy_from_slice(&data[..n]);
    block.set_range(block.offset(), n as u64);

    if let Err(mpsc::error::SendError(unclaimed)) = reply.send(Ok(block)).await {
        // Receiver gone; the block would otherwise leave the pool for good.
        if let Ok(block) = unclaimed {
            pool.release_block(block)?;
        }
    }
    Ok(())
}
