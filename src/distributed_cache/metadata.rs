//! Per-object metadata documents
//!
//! Every cached object has a JSON document under `Objects/` holding an open
//! count and the chunk layout. Documents are shared by all nodes, so every
//! mutation is a read, transform and conditional write on the etag that was
//! read. Losing the race re-runs the whole cycle against fresh state.
//!
//! ```text
//!   ┌────────────┐   ┌───────────────┐   ┌────────────────────────┐
//!   │ get_attr + │──▶│ transform(doc)│──▶│ write IfMatch(etag)    │──▶ done
//!   │ read JSON  │   └───────────────┘   └────────────────────────┘
//!   └────────────┘                                 │ ConditionNotMet
//!         ▲                                        │
//!         └──────────────── backoff ◀──────────────┘
//! ```
//!
//! Fields this crate does not know about are carried through untouched.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::bootstrap::CacheLayout;
use super::retry::{retry_on_conflict, RetryPolicy};
use crate::error::{Error, Result};
use crate::storage::{ETag, ObjectStore, WriteCondition};

// =============================================================================
// Document model
// =============================================================================

/// Metadata of one cached object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    /// Number of outstanding opens
    #[serde(rename = "open-count", default)]
    pub open_count: u64,

    /// Chunk layout, at most one entry per chunk id
    #[serde(default)]
    pub layout: Vec<LayoutEntry>,

    /// Unknown top-level keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetadataDocument {
    pub fn new(layout: Vec<LayoutEntry>) -> Self {
        Self {
            open_count: 0,
            layout,
            extra: Map::new(),
        }
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&LayoutEntry> {
        self.layout.iter().find(|e| e.chunk_id == chunk_id)
    }

    fn chunk_mut(&mut self, chunk_id: &str) -> Option<&mut LayoutEntry> {
        self.layout.iter_mut().find(|e| e.chunk_id == chunk_id)
    }
}

/// Placement of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutEntry {
    #[serde(rename = "chunk-id")]
    pub chunk_id: String,

    /// Free-form replica description
    #[serde(default)]
    pub replicas: Map<String, Value>,

    /// Unknown per-entry keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LayoutEntry {
    pub fn new(chunk_id: impl Into<String>, replicas: Map<String, Value>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            replicas,
            extra: Map::new(),
        }
    }
}

/// A document together with the etag it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub document: MetadataDocument,
    pub etag: ETag,
}

/// Serialize with four-space indentation.
pub fn encode_document(doc: &MetadataDocument) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(256);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut ser)?;
    Ok(Bytes::from(buf))
}

fn decode_document(path: &str, data: &[u8]) -> Result<MetadataDocument> {
    serde_json::from_slice(data).map_err(|e| Error::InvalidDocument {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Store
// =============================================================================

/// Optimistic read-modify-write access to metadata documents.
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn ObjectStore>,
    layout: CacheLayout,
    policy: RetryPolicy,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("layout", &self.layout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl MetadataStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: CacheLayout, policy: RetryPolicy) -> Self {
        Self {
            store,
            layout,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Store path of an object's document.
    pub fn document_path(&self, object: &str) -> String {
        self.layout.object_path(object)
    }

    async fn read_at(&self, path: &str) -> Result<VersionedDocument> {
        // The tag must be taken before the content: a tag newer than the
        // content could let a stale transform overwrite a concurrent update.
        let attr = self.store.get_attr(path).await?;
        let data = self.store.read_buffer(path, 0, 0).await?;
        Ok(VersionedDocument {
            document: decode_document(path, &data)?,
            etag: attr.etag,
        })
    }

    /// Write a fresh document. Fails with `Error::AlreadyExists` if one exists.
    #[instrument(skip(self, layout), fields(chunks = layout.len()))]
    pub async fn create_document(&self, object: &str, layout: Vec<LayoutEntry>) -> Result<()> {
        let path = self.document_path(object);
        let body = encode_document(&MetadataDocument::new(layout))?;
        self.store
            .write_from_buffer(&path, body, WriteCondition::IfNoneMatch)
            .await?;
        debug!(path = %path, "Created metadata document");
        Ok(())
    }

    /// Current document and its etag.
    pub async fn read_document(&self, object: &str) -> Result<VersionedDocument> {
        self.read_at(&self.document_path(object)).await
    }

    /// Apply `transform` to the document until the write lands.
    ///
    /// `transform` runs once per attempt against freshly read state and must
    /// not depend on earlier attempts. An error from it aborts the update
    /// without retrying.
    pub async fn update_document<F>(
        &self,
        object: &str,
        operation: &str,
        transform: F,
    ) -> Result<MetadataDocument>
    where
        F: Fn(&mut MetadataDocument) -> Result<()> + Send + Sync,
    {
        let path = self.document_path(object);
        let path = path.as_str();
        let transform = &transform;

        retry_on_conflict(&self.policy, operation, path, move |_| async move {
            let VersionedDocument { mut document, etag } = self.read_at(path).await?;
            transform(&mut document)?;
            let body = encode_document(&document)?;
            self.store
                .write_from_buffer(path, body, WriteCondition::IfMatch(etag))
                .await?;
            Ok(document)
        })
        .await
    }

    /// Increment the open count, returning the document as written.
    #[instrument(skip(self))]
    pub async fn open_document(&self, object: &str) -> Result<MetadataDocument> {
        self.update_document(object, "open document", |doc| {
            doc.open_count += 1;
            Ok(())
        })
        .await
    }

    /// Decrement the open count. Closing a document nobody has open is an error.
    #[instrument(skip(self))]
    pub async fn close_document(&self, object: &str) -> Result<MetadataDocument> {
        let path = self.document_path(object);
        self.update_document(object, "close document", |doc| {
            if doc.open_count == 0 {
                return Err(Error::InvalidDocument {
                    path: path.clone(),
                    reason: "open-count is already zero".into(),
                });
            }
            doc.open_count -= 1;
            Ok(())
        })
        .await
    }

    /// Append a layout entry for a new chunk.
    #[instrument(skip(self, replicas))]
    pub async fn create_chunk_entry(
        &self,
        object: &str,
        chunk_id: &str,
        replicas: Map<String, Value>,
    ) -> Result<MetadataDocument> {
        let path = self.document_path(object);
        self.update_document(object, "create chunk entry", |doc| {
            if doc.chunk(chunk_id).is_some() {
                return Err(Error::ChunkAlreadyExists {
                    path: path.clone(),
                    chunk_id: chunk_id.to_string(),
                });
            }
            doc.layout.push(LayoutEntry::new(chunk_id, replicas.clone()));
            Ok(())
        })
        .await
    }

    /// Replace the replicas of an existing chunk.
    #[instrument(skip(self, replicas))]
    pub async fn update_replica(
        &self,
        object: &str,
        chunk_id: &str,
        replicas: Map<String, Value>,
    ) -> Result<MetadataDocument> {
        let path = self.document_path(object);
        self.update_document(object, "update replica", |doc| {
            let entry = doc.chunk_mut(chunk_id).ok_or_else(|| Error::ChunkNotFound {
                path: path.clone(),
                chunk_id: chunk_id.to_string(),
            })?;
            entry.replicas = replicas.clone();
            Ok(())
        })
        .await
    }
}
