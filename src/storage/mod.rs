//! Object store port
//!
//! The shared store every node coordinates through. Paths are `/`-separated
//! and relative to the store root; directories are explicit entries.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   ObjectStore (trait)                     │
//! │  get_attr │ create_dir │ read_buffer │ write_from_buffer  │
//! │                         list                              │
//! └──────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//!  InMemoryObjectStore                 LocalFsObjectStore
//!  (DashMap, tests)                    (files under a root dir)
//! ```
//!
//! Every object carries an [`ETag`] that changes whenever its content
//! changes. Conditional writes compare and swap on that tag, which is the
//! only cross-node synchronization primitive the cache relies on.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

mod local;
mod memory;

pub use local::LocalFsObjectStore;
pub use memory::{InMemoryObjectStore, InMemoryStoreStats};

// =============================================================================
// Value Objects
// =============================================================================

/// Opaque version tag of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attributes of a stored object or directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectAttr {
    /// Normalized path relative to the store root
    pub path: String,
    /// Version tag; empty for directories
    pub etag: ETag,
    /// Content length in bytes; 0 for directories
    pub size: u64,
    pub is_dir: bool,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

impl ObjectAttr {
    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Precondition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    /// Unconditional overwrite
    #[default]
    None,
    /// Create only; fails with `Error::AlreadyExists` if the object exists
    IfNoneMatch,
    /// Replace only if the current tag matches; fails with `Error::ConditionNotMet`
    IfMatch(ETag),
}

// =============================================================================
// Port
// =============================================================================

/// Shared object store used for cache coordination.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Attributes of an object or directory. `Error::NotFound` if absent.
    async fn get_attr(&self, path: &str) -> Result<ObjectAttr>;

    /// Create a directory. `Error::AlreadyExists` if anything exists at `path`.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Read `length` bytes starting at `offset`. A `length` of 0 reads to
    /// the end; a range running past the end is clipped.
    async fn read_buffer(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Write a whole object under `condition`, returning its new attributes.
    async fn write_from_buffer(
        &self,
        path: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Result<ObjectAttr>;

    /// Direct children of a directory. `Error::NotFound` if it does not exist.
    async fn list(&self, dir: &str) -> Result<Vec<ObjectAttr>>;

    /// Size of an object in bytes. Backends that can answer without
    /// computing an etag should override this.
    async fn object_size(&self, path: &str) -> Result<u64> {
        Ok(self.get_attr(path).await?.size)
    }
}

/// Strip leading and trailing separators and collapse empty components.
pub(crate) fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a directory and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    let name = normalize_path(name);
    if dir.is_empty() {
        name
    } else {
        format!("{}/{}", dir, name)
    }
}
