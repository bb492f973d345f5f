//! meshcache - Distributed Cache Coordination
//!
//! Building blocks for a cache shared by several nodes that can only talk to
//! each other through a common object store.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!   node A ──────▶│                                      │◀────── node B
//!                 │  __CACHE__<id>/creator.txt           │
//!   heartbeat ───▶│  __CACHE__<id>/Nodes/<node>.hb       │◀─── heartbeat
//!   metadata CAS ▶│  __CACHE__<id>/Objects/<object>      │◀─ metadata CAS
//!                 └──────────────────────────────────────┘
//!                              ObjectStore
//! ```
//!
//! Locally each node keeps a [`BlockPool`] of preallocated buffers and a
//! [`WorkerPool`] that fills them from the store.
//!
//! # Modules
//!
//! - [`block_pool`] - Fixed pool of memory mapped blocks
//! - [`worker_pool`] - Bounded async worker pool
//! - [`storage`] - Object store port and adapters
//! - [`distributed_cache`] - Bootstrap, metadata, heartbeats and loading
//! - [`config`] - Node configuration
//! - [`error`] - Error types

pub mod block_pool;
pub mod config;
pub mod distributed_cache;
pub mod error;
pub mod storage;
pub mod worker_pool;

// Re-export commonly used types
pub use block_pool::{Block, BlockPool};
pub use config::CacheConfig;
pub use distributed_cache::{
    BlockLoader, BootstrapOutcome, CacheLayout, DistributedCache, HeartbeatManager,
    MetadataStore, NodeIdentity, RetryPolicy,
};
pub use error::{Error, Result};
pub use storage::{
    ETag, InMemoryObjectStore, LocalFsObjectStore, ObjectAttr, ObjectStore, WriteCondition,
};
pub use worker_pool::WorkerPool;
