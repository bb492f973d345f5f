//! Fixed-capacity pool of reusable memory blocks
//!
//! Blocks are mapped once when the pool is created and handed out under
//! exclusive ownership, so hot-path I/O never pays allocation cost.
//!
//! ```text
//!   BlockPool::new(block_size, mem_size)
//!        │  maps mem_size / block_size buffers up front
//!        ▼
//!   ┌──────────────────────────────┐
//!   │  free list (bounded channel) │◀── release_block(block)
//!   └──────────────────────────────┘
//!        │ get_block()        (blocks until one is free)
//!        │ get_block_no_wait() (None when exhausted)
//!        ▼
//!     caller owns Block<T>
//! ```

mod block;
pub mod buffer;
mod pool;

pub use block::Block;
pub use buffer::MmapBuffer;
pub use pool::BlockPool;
