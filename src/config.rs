//! Distributed cache configuration
//!
//! Settings come from an optional YAML file with a `distributed_cache:`
//! section, then command line flags override individual keys. Keys use the
//! same kebab-case names in both places.
//!
//! ```yaml
//! distributed_cache:
//!   cache-id: blue
//!   path: /var/cache/meshcache
//!   heartbeat-duration: 30
//!   replicas: 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distributed_cache::heartbeat::{
    HeartbeatConfig, DEFAULT_HEARTBEAT_SECS, DEFAULT_MAX_MISSED_HEARTBEATS,
};
use crate::distributed_cache::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::error::{Error, Result};

/// Default chunk size (16 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
/// Default replica count per chunk
pub const DEFAULT_REPLICAS: u32 = 3;
/// Default pooled block size (4 MiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
/// Default memory reserved for the block pool (64 MiB)
pub const DEFAULT_MEMORY_SIZE: u64 = 64 * 1024 * 1024;
/// Default number of loader workers
pub const DEFAULT_WORKERS: usize = 8;
/// Default pause between conflicting metadata updates
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;

/// Settings of one node in a distributed cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Cache identity shared by every participating node
    pub cache_id: String,

    /// Local cache directory
    pub path: PathBuf,

    /// Chunk size in bytes. Not used by this crate; validated and exposed
    /// through [`DistributedCache::config`](crate::DistributedCache::config)
    /// for the placement layer that cuts objects into chunks.
    pub chunk_size: u64,

    /// Capacity advertised to peers, 0 for unbounded
    pub max_cache_size: u64,

    /// Replicas per chunk. Passed through like `chunk_size`; placement
    /// picks this many hosts from `HeartbeatManager::live_nodes`.
    pub replicas: u32,

    /// Heartbeat interval in seconds
    pub heartbeat_duration: u64,

    /// Missed heartbeats tolerated before a peer is Down
    pub max_missed_heartbeats: u32,

    /// Size of each pooled block
    pub block_size: u64,

    /// Memory reserved for pooled blocks
    pub memory_size: u64,

    /// Loader worker count
    pub workers: usize,

    /// Attempts per metadata update
    pub retry_max_attempts: u32,

    /// Pause between conflicting metadata attempts, in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_id: String::new(),
            path: PathBuf::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_cache_size: 0,
            replicas: DEFAULT_REPLICAS,
            heartbeat_duration: DEFAULT_HEARTBEAT_SECS,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            block_size: DEFAULT_BLOCK_SIZE,
            memory_size: DEFAULT_MEMORY_SIZE,
            workers: DEFAULT_WORKERS,
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    distributed_cache: Option<CacheConfig>,
}

impl CacheConfig {
    pub fn new(cache_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            cache_id: cache_id.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Parse the `distributed_cache:` section of a YAML document. A document
    /// without the section yields the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid config file: {}", e)))?;
        Ok(file.distributed_cache.unwrap_or_default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_id.trim().is_empty() {
            return Err(Error::Config("cache-id not set".into()));
        }
        if self.cache_id.contains('/') {
            return Err(Error::Config("cache-id must not contain '/'".into()));
        }
        if self.path.as_os_str().is_empty() {
            return Err(Error::Config("path not set".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk-size must be > 0".into()));
        }
        if self.replicas == 0 {
            return Err(Error::Config("replicas must be > 0".into()));
        }
        if self.heartbeat_duration == 0 {
            return Err(Error::Config("heartbeat-duration must be > 0".into()));
        }
        if self.block_size == 0 || self.memory_size < self.block_size {
            return Err(Error::Config(
                "memory-size must hold at least one block of block-size".into(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be > 0".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(Error::Config("retry-max-attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_duration)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval(),
            max_missed: self.max_missed_heartbeats,
            total_space: self.max_cache_size,
            cache_path: Some(self.path.clone()),
        }
    }
}
