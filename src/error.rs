//! Error types for meshcache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in meshcache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    /// Object or directory does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object or directory already exists
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Conditional write rejected because the entity tag changed
    #[error("Condition not met for {path}: entity tag changed")]
    ConditionNotMet { path: String },

    /// Any other object store failure
    #[error("Object store error: {0}")]
    Store(String),

    // =========================================================================
    // Block Pool / Worker Pool Errors
    // =========================================================================
    /// Invalid block pool sizing
    #[error("Invalid block pool configuration: block size {block_size}, memory size {mem_size}")]
    InvalidPoolConfig { block_size: u64, mem_size: u64 },

    /// Buffer mapping failed
    #[error("Buffer allocation failed for size {size}: {reason}")]
    BufferAllocation { size: u64, reason: String },

    /// Buffer unmapping failed, likely memory corruption
    #[error("Failed to release {failed} buffer(s): {reason}")]
    BufferRelease { failed: usize, reason: String },

    /// Invalid worker pool configuration
    #[error("Invalid worker pool configuration: {0}")]
    InvalidWorkerConfig(String),

    /// Worker pool used in the wrong state
    #[error("Worker pool is {0}")]
    WorkerPoolState(&'static str),

    // =========================================================================
    // Distributed Cache Errors
    // =========================================================================
    /// Bootstrap of the shared cache tree failed
    #[error("Cache bootstrap failed while trying to {stage}: {source}")]
    Bootstrap {
        stage: String,
        #[source]
        source: Box<Error>,
    },

    /// Metadata document is malformed
    #[error("Invalid metadata document {path}: {reason}")]
    InvalidDocument { path: String, reason: String },

    /// Layout has no entry for the requested chunk
    #[error("Chunk {chunk_id} not found in layout of {path}")]
    ChunkNotFound { path: String, chunk_id: String },

    /// Layout already has an entry for the chunk
    #[error("Chunk {chunk_id} already exists in layout of {path}")]
    ChunkAlreadyExists { path: String, chunk_id: String },

    /// Optimistic update lost every race
    #[error("{operation} on {path} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        path: String,
        attempts: u32,
    },

    /// Heartbeat manager used in the wrong state
    #[error("Heartbeat manager is {0}")]
    HeartbeatState(&'static str),
}

impl Error {
    /// True for "object not found" conditions
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for "already exists" conditions
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// True when a conditional write lost to a concurrent writer
    pub fn is_condition_not_met(&self) -> bool {
        matches!(self, Error::ConditionNotMet { .. })
    }

    /// Wrap an error as a bootstrap failure at the given stage
    pub fn bootstrap(stage: impl Into<String>, source: Error) -> Self {
        Error::Bootstrap {
            stage: stage.into(),
            source: Box::new(source),
        }
    }
}
