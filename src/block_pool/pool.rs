//! Block pool implementation

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, error, warn};

use super::block::Block;
use crate::error::{Error, Result};

/// A fixed set of equally sized blocks.
///
/// The pool never grows after construction. Free blocks live in a bounded
/// channel whose capacity equals the number of blocks, so acquire and release
/// are plain channel operations.
#[derive(Debug)]
pub struct BlockPool<T> {
    /// Free blocks
    free_tx: Sender<Block<T>>,
    free_rx: Receiver<Block<T>>,
    /// Size of each block in bytes
    block_size: u64,
    /// Number of blocks owned by this pool
    max_blocks: usize,
}

impl<T: Default> BlockPool<T> {
    /// Create a pool of `mem_size / block_size` blocks of `block_size` bytes.
    ///
    /// Every block is mapped eagerly. A single mapping failure aborts the
    /// whole construction and unmaps what was already mapped.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidPoolConfig` if `block_size` is 0 or `mem_size < block_size`
    /// - `Error::BufferAllocation` if a mapping fails
    pub fn new(block_size: u64, mem_size: u64) -> Result<Self> {
        if block_size == 0 || mem_size < block_size {
            error!(block_size, mem_size, "Invalid block pool configuration");
            return Err(Error::InvalidPoolConfig {
                block_size,
                mem_size,
            });
        }

        let block_count = usize::try_from(mem_size / block_size).map_err(|_| Error::InvalidPoolConfig {
            block_size,
            mem_size,
        })?;
        let buffer_size = usize::try_from(block_size).map_err(|_| Error::InvalidPoolConfig {
            block_size,
            mem_size,
        })?;

        let (free_tx, free_rx) = bounded(block_count);

        for i in 0..block_count {
            match Block::allocate(buffer_size) {
                Ok(block) => {
                    // Capacity is block_count, this cannot be full.
                    if free_tx.try_send(block).is_err() {
                        return Err(Error::Internal("block pool channel overflow".into()));
                    }
                }
                Err(e) => {
                    error!(allocated = i, block_count, "Block pool allocation failed: {}", e);
                    // Dropping the channel unmaps every block mapped so far.
                    return Err(e);
                }
            }
        }

        debug!(block_size, block_count, "Block pool allocated");

        Ok(Self {
            free_tx,
            free_rx,
            block_size,
            max_blocks: block_count,
        })
    }
}

impl<T> BlockPool<T> {
    /// Size of each block in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks owned by the pool.
    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Number of blocks currently free.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Percentage of blocks currently checked out.
    pub fn usage(&self) -> u32 {
        let used = self.max_blocks.saturating_sub(self.available()) as u64;
        ((used * 100) / self.max_blocks as u64) as u32
    }

    /// Acquire a block, waiting until one is released if none is free.
    ///
    /// This parks the calling thread; from async code call it through
    /// `tokio::task::spawn_blocking` or use [`BlockPool::get_block_no_wait`].
    pub fn get_block(&self) -> Result<Block<T>> {
        let mut block = self
            .free_rx
            .recv()
            .map_err(|_| Error::Internal("block pool channel closed".into()))?;
        block.reuse();
        Ok(block)
    }

    /// Acquire a block if one is immediately free.
    pub fn get_block_no_wait(&self) -> Option<Block<T>> {
        match self.free_rx.try_recv() {
            Ok(mut block) => {
                block.reuse();
                Some(block)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Hand a block back to the pool.
    ///
    /// # Errors
    ///
    /// A block whose size does not match, or that would push the pool past
    /// its capacity, did not come from this pool. It is dropped (unmapped)
    /// and `Error::Internal` is returned.
    pub fn release_block(&self, block: Block<T>) -> Result<()> {
        if block.capacity() as u64 != self.block_size {
            error!(
                expected = self.block_size,
                actual = block.capacity(),
                "Foreign block released to pool"
            );
            return Err(Error::Internal(format!(
                "released block of size {} into pool of {} byte blocks",
                block.capacity(),
                self.block_size
            )));
        }

        match self.free_tx.try_send(block) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!(max_blocks = self.max_blocks, "Block released into a full pool");
                Err(Error::Internal("block pool already holds all of its blocks".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Internal("block pool channel closed".into()))
            }
        }
    }

    /// Tear the pool down, unmapping every free block.
    ///
    /// Blocks still checked out are unmapped when their owners drop them.
    /// Every unmap failure is logged; any failure makes this return
    /// `Error::BufferRelease`.
    pub fn terminate(self) -> Result<()> {
        let outstanding = self.max_blocks.saturating_sub(self.available());
        if outstanding > 0 {
            warn!(outstanding, "Terminating block pool with blocks still checked out");
        }

        let mut failed = 0usize;
        let mut last_reason = String::new();

        for block in self.free_rx.try_iter() {
            if let Err(e) = block.release() {
                error!("Block release failed, possible memory corruption: {}", e);
                failed += 1;
                last_reason = e.to_string();
            }
        }

        if failed > 0 {
            return Err(Error::BufferRelease {
                failed,
                reason: last_reason,
            });
        }

        debug!(block_size = self.block_size, "Block pool terminated");
        Ok(())
    }
}
