//! Filesystem object store
//!
//! Objects are regular files under a root directory and directories are
//! directories. The etag of a file is the hex xxh64 digest of its content,
//! hashed in chunks whenever an etag is asked for. Sizes come from file
//! metadata and ranged reads seek instead of loading the whole file.
//!
//! Writes go to a hidden temp file in the target directory first and are then
//! moved into place, so readers never observe a partially written object:
//!
//! - unconditional and `IfMatch` writes `rename` the temp file over the target
//! - `IfNoneMatch` writes `hard_link` the temp file, which fails if the
//!   target already exists
//!
//! Conditional writes are serialized by an in-process lock. Two processes
//! sharing one root get create-only semantics from the filesystem but
//! `IfMatch` is only best-effort between them.

use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use xxhash_rust::xxh64::{xxh64, Xxh64};

use super::{normalize_path, ETag, ObjectAttr, ObjectStore, WriteCondition};
use crate::error::{Error, Result};

/// Prefix of in-flight temp files, hidden from `list`.
const TEMP_PREFIX: &str = ".tmp-";

/// Read size while hashing a file for its etag
const HASH_CHUNK: usize = 64 * 1024;

/// [`ObjectStore`] over a local or network-mounted directory
#[derive(Debug)]
pub struct LocalFsObjectStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalFsObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Opened local object store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let normalized = normalize_path(path);
        let relative = Path::new(&normalized);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Store(format!("invalid object path: {}", path)));
        }
        Ok((normalized.clone(), self.root.join(relative)))
    }

    async fn attr_of(&self, path: &str, full: &Path) -> Result<ObjectAttr> {
        let meta = tokio::fs::metadata(full)
            .await
            .map_err(|e| map_io(path, e))?;
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        if meta.is_dir() {
            return Ok(ObjectAttr {
                path: path.to_string(),
                etag: ETag::new(""),
                size: 0,
                is_dir: true,
                modified,
            });
        }

        let etag = file_etag(full).await.map_err(|e| map_io(path, e))?;
        Ok(ObjectAttr {
            path: path.to_string(),
            etag,
            size: meta.len(),
            is_dir: false,
            modified,
        })
    }

    async fn write_temp(&self, full: &Path, data: &[u8]) -> Result<PathBuf> {
        let parent = full
            .parent()
            .ok_or_else(|| Error::Store(format!("no parent for {}", full.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let temp = parent.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, data).await?;
        Ok(temp)
    }
}

fn content_etag(data: &[u8]) -> ETag {
    ETag::new(format!("{:016x}", xxh64(data, 0)))
}

async fn file_etag(full: &Path) -> io::Result<ETag> {
    let mut file = tokio::fs::File::open(full).await?;
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ETag::new(format!("{:016x}", hasher.digest())))
}

fn map_io(path: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_string()),
        _ => Error::Io(e),
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn get_attr(&self, path: &str) -> Result<ObjectAttr> {
        let (path, full) = self.resolve(path)?;
        self.attr_of(&path, &full).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let (path, full) = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir(&full)
            .await
            .map_err(|e| map_io(&path, e))
    }

    async fn read_buffer(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let (path, full) = self.resolve(path)?;
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| map_io(&path, e))?;

        let size = file.metadata().await?.len();
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
        let wanted = end - offset;

        file.seek(SeekFrom::Start(offset)).await?;
        let capacity = usize::try_from(wanted)
            .map_err(|_| Error::Store(format!("range of {} too large to buffer", path)))?;
        let mut data = Vec::with_capacity(capacity);
        file.take(wanted).read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }

    async fn write_from_buffer(
        &self,
        path: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Result<ObjectAttr> {
        let (path, full) = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        if let WriteCondition::IfMatch(expected) = &condition {
            let current = match file_etag(&full).await {
                Ok(current) => current,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::ConditionNotMet { path });
                }
                Err(e) => return Err(map_io(&path, e)),
            };
            if current != *expected {
                return Err(Error::ConditionNotMet { path });
            }
        }

        let temp = self.write_temp(&full, &data).await?;

        let placed = match condition {
            WriteCondition::IfNoneMatch => {
                let linked = tokio::fs::hard_link(&temp, &full).await;
                if let Err(e) = tokio::fs::remove_file(&temp).await {
                    warn!(temp = %temp.display(), "Failed to remove temp file: {}", e);
                }
                linked
            }
            WriteCondition::None | WriteCondition::IfMatch(_) => {
                tokio::fs::rename(&temp, &full).await
            }
        };

        if let Err(e) = placed {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(map_io(&path, e));
        }

        Ok(ObjectAttr {
            etag: content_etag(&data),
            size: data.len() as u64,
            is_dir: false,
            modified: Utc::now(),
            path,
        })
    }

    async fn list(&self, dir: &str) -> Result<Vec<ObjectAttr>> {
        let (dir, full) = self.resolve(dir)?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| map_io(&dir, e))?;

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let child = super::join_path(&dir, name);
            match self.attr_of(&child, &entry.path()).await {
                Ok(attr) => children.push(attr),
                // Raced with a rename or removal.
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    async fn object_size(&self, path: &str) -> Result<u64> {
        let (path, full) = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| map_io(&path, e))?;
        Ok(if meta.is_dir() { 0 } else { meta.len() })
    }
}
