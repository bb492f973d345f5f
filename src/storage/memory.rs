//! In-memory object store
//!
//! Used by tests and single-process setups. Each key is updated under its
//! DashMap shard lock, so a conditional write is a single atomic
//! compare-and-swap.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{normalize_path, ETag, ObjectAttr, ObjectStore, WriteCondition};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Node {
    Dir {
        modified: DateTime<Utc>,
    },
    Object {
        data: Bytes,
        etag: ETag,
        modified: DateTime<Utc>,
    },
}

impl Node {
    fn attr(&self, path: &str) -> ObjectAttr {
        match self {
            Node::Dir { modified } => ObjectAttr {
                path: path.to_string(),
                etag: ETag::new(""),
                size: 0,
                is_dir: true,
                modified: *modified,
            },
            Node::Object {
                data,
                etag,
                modified,
            } => ObjectAttr {
                path: path.to_string(),
                etag: etag.clone(),
                size: data.len() as u64,
                is_dir: false,
                modified: *modified,
            },
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStoreStats {
    pub reads: u64,
    pub writes: u64,
    /// Conditional writes rejected by their precondition
    pub conflicts: u64,
    pub objects: u64,
}

/// DashMap-backed [`ObjectStore`]
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    entries: DashMap<String, Node>,
    /// Source of etags, bumped on every successful write
    version: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    conflicts: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the store counters.
    pub fn stats(&self) -> InMemoryStoreStats {
        let objects = self
            .entries
            .iter()
            .filter(|e| matches!(e.value(), Node::Object { .. }))
            .count() as u64;
        InMemoryStoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            objects,
        }
    }

    /// Delete an object or directory entry. Returns whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.entries.remove(&normalize_path(path)).is_some()
    }

    fn next_etag(&self) -> ETag {
        let v = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        ETag::new(format!("0x{:016X}", v))
    }

    fn conflict(&self, path: String) -> Error {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        Error::ConditionNotMet { path }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_attr(&self, path: &str) -> Result<ObjectAttr> {
        let path = normalize_path(path);
        self.entries
            .get(&path)
            .map(|node| node.attr(&path))
            .ok_or(Error::NotFound(path))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        match self.entries.entry(path) {
            Entry::Occupied(o) => Err(Error::AlreadyExists(o.key().clone())),
            Entry::Vacant(v) => {
                v.insert(Node::Dir {
                    modified: Utc::now(),
                });
                Ok(())
            }
        }
    }

    async fn read_buffer(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let path = normalize_path(path);
        let data = match self.entries.get(&path).as_deref() {
            Some(Node::Object { data, .. }) => data.clone(),
            Some(Node::Dir { .. }) => {
                return Err(Error::Store(format!("{} is a directory", path)));
            }
            None => return Err(Error::NotFound(path)),
        };

        let size = data.len() as u64;
        if offset > size {
            return Err(Error::Store(format!(
                "offset {} beyond end of {} ({} bytes)",
                offset, path, size
            )));
        }
        let end = if length == 0 {
            size
        } else {
            std::cmp::min(size, offset.saturating_add(length))
        };
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn write_from_buffer(
        &self,
        path: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Result<ObjectAttr> {
        let path = normalize_path(path);

        match self.entries.entry(path.clone()) {
            Entry::Occupied(mut o) => {
                match (o.get(), &condition) {
                    (Node::Dir { .. }, _) => {
                        return Err(Error::Store(format!("{} is a directory", path)));
                    }
                    (Node::Object { .. }, WriteCondition::IfNoneMatch) => {
                        self.conflicts.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::AlreadyExists(path));
                    }
                    (Node::Object { etag, .. }, WriteCondition::IfMatch(expected))
                        if etag != expected =>
                    {
                        return Err(self.conflict(path));
                    }
                    _ => {}
                }
                let node = Node::Object {
                    data,
                    etag: self.next_etag(),
                    modified: Utc::now(),
                };
                let attr = node.attr(&path);
                o.insert(node);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(attr)
            }
            Entry::Vacant(v) => {
                if let WriteCondition::IfMatch(_) = condition {
                    return Err(self.conflict(path));
                }
                let node = Node::Object {
                    data,
                    etag: self.next_etag(),
                    modified: Utc::now(),
                };
                let attr = node.attr(&path);
                v.insert(node);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(attr)
            }
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<ObjectAttr>> {
        let dir = normalize_path(dir);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let mut found_dir = dir.is_empty();
        let mut children = Vec::new();
        for entry in self.entries.iter() {
            let key = entry.key();
            if *key == dir {
                found_dir = true;
                continue;
            }
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.push(entry.value().attr(key));
                }
            }
        }

        if !found_dir {
            return Err(Error::NotFound(dir));
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }
}
