//! Shared cache tree creation
//!
//! The first node to start for a cache identity creates the tree on the
//! store; every other node finds it already there. `creator.txt` is written
//! create-only, so exactly one node ever wins, and a node that loses the race
//! simply joins the existing cache.
//!
//! ```text
//! __CACHE__<cacheID>/
//!   creator.txt      creator's address
//!   Nodes/           <nodeId>.hb heartbeat records
//!   Objects/         per-object metadata documents
//! ```

use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::storage::{join_path, ObjectStore, WriteCondition};

/// Prefix of every cache root directory
pub const CACHE_ROOT_PREFIX: &str = "__CACHE__";
/// Name of the first-writer marker
pub const CREATOR_FILE: &str = "creator.txt";
pub const NODES_DIR: &str = "Nodes";
pub const OBJECTS_DIR: &str = "Objects";
/// Extension of heartbeat records under `Nodes/`
pub const HEARTBEAT_EXTENSION: &str = "hb";

/// Store paths of one cache identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    cache_id: String,
    root: String,
}

impl CacheLayout {
    pub fn new(cache_id: impl Into<String>) -> Self {
        let cache_id = cache_id.into();
        let root = format!("{}{}", CACHE_ROOT_PREFIX, cache_id);
        Self { cache_id, root }
    }

    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    /// `__CACHE__<cacheID>`
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn creator_path(&self) -> String {
        join_path(&self.root, CREATOR_FILE)
    }

    pub fn nodes_dir(&self) -> String {
        join_path(&self.root, NODES_DIR)
    }

    pub fn objects_dir(&self) -> String {
        join_path(&self.root, OBJECTS_DIR)
    }

    /// Metadata document of a cached object.
    pub fn object_path(&self, object: &str) -> String {
        join_path(&self.objects_dir(), object)
    }

    /// Heartbeat record of a node.
    pub fn heartbeat_path(&self, node_id: &str) -> String {
        join_path(
            &self.nodes_dir(),
            &format!("{}.{}", node_id, HEARTBEAT_EXTENSION),
        )
    }

    /// Node id encoded in a heartbeat record name, if it is one.
    pub fn node_id_from_record(name: &str) -> Option<&str> {
        name.strip_suffix(HEARTBEAT_EXTENSION)
            .and_then(|stem| stem.strip_suffix('.'))
            .filter(|id| !id.is_empty())
    }
}

/// How a bootstrap call concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The tree existed before this call
    AlreadyInitialized,
    /// This node wrote `creator.txt`
    Created,
    /// Another node won the race to write `creator.txt`
    JoinedExisting,
}

/// Make sure the cache tree exists, creating it if this node is first.
///
/// Safe to call concurrently from any number of nodes and to repeat.
///
/// # Errors
///
/// Any store failure other than the expected not-found/already-exists
/// outcomes is returned as `Error::Bootstrap`.
#[instrument(skip(store, layout), fields(cache_id = layout.cache_id()))]
pub async fn bootstrap(
    store: &dyn ObjectStore,
    layout: &CacheLayout,
    creator_address: &str,
) -> Result<BootstrapOutcome> {
    let creator = layout.creator_path();

    match store.get_attr(&creator).await {
        Ok(_) => {
            debug!("Cache already initialized");
            return Ok(BootstrapOutcome::AlreadyInitialized);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(Error::bootstrap("probe creator marker", e)),
    }

    for dir in [layout.root().to_string(), layout.nodes_dir(), layout.objects_dir()] {
        match store.create_dir(&dir).await {
            Ok(()) => debug!(dir = %dir, "Created cache directory"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(Error::bootstrap(format!("create directory {}", dir), e)),
        }
    }

    let marker = Bytes::from(creator_address.to_string());
    match store
        .write_from_buffer(&creator, marker, WriteCondition::IfNoneMatch)
        .await
    {
        Ok(_) => {
            info!(creator = creator_address, "Created distributed cache");
            Ok(BootstrapOutcome::Created)
        }
        Err(e) if e.is_already_exists() => {
            info!("Joined distributed cache created by another node");
            Ok(BootstrapOutcome::JoinedExisting)
        }
        Err(e) => Err(Error::bootstrap("write creator marker", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[test]
    fn test_layout_paths() {
        let layout = CacheLayout::new("blue");
        assert_eq!(layout.root(), "__CACHE__blue");
        assert_eq!(layout.creator_path(), "__CACHE__blue/creator.txt");
        assert_eq!(layout.nodes_dir(), "__CACHE__blue/Nodes");
        assert_eq!(layout.objects_dir(), "__CACHE__blue/Objects");
        assert_eq!(layout.object_path("a.bin"), "__CACHE__blue/Objects/a.bin");
        assert_eq!(layout.heartbeat_path("n1"), "__CACHE__blue/Nodes/n1.hb");
    }

    #[test]
    fn test_node_id_from_record() {
        assert_eq!(CacheLayout::node_id_from_record("n1.hb"), Some("n1"));
        assert_eq!(CacheLayout::node_id_from_record("a.b.hb"), Some("a.b"));
        assert_eq!(CacheLayout::node_id_from_record(".hb"), None);
        assert_eq!(CacheLayout::node_id_from_record("n1.json"), None);
    }

    #[tokio::test]
    async fn test_first_node_creates_tree() {
        let store = InMemoryObjectStore::new();
        let layout = CacheLayout::new("c1");

        let outcome = bootstrap(&store, &layout, "10.0.0.1").await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Created);

        let marker = store.read_buffer(&layout.creator_path(), 0, 0).await.unwrap();
        assert_eq!(&marker[..], b"10.0.0.1");
        assert!(store.get_attr(&layout.nodes_dir()).await.unwrap().is_dir);
        assert!(store.get_attr(&layout.objects_dir()).await.unwrap().is_dir);

        let again = bootstrap(&store, &layout, "10.0.0.2").await.unwrap();
        assert_eq!(again, BootstrapOutcome::AlreadyInitialized);
        let marker = store.read_buffer(&layout.creator_path(), 0, 0).await.unwrap();
        assert_eq!(&marker[..], b"10.0.0.1");
    }

    #[tokio::test]
    async fn test_tolerates_existing_directories() {
        let store = InMemoryObjectStore::new();
        let layout = CacheLayout::new("c1");
        store.create_dir(layout.root()).await.unwrap();
        store.create_dir(&layout.nodes_dir()).await.unwrap();

        let outcome = bootstrap(&store, &layout, "10.0.0.1").await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_nodes_single_creator() {
        let store = Arc::new(InMemoryObjectStore::new());
        let layout = CacheLayout::new("race");

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            let layout = layout.clone();
            handles.push(tokio::spawn(async move {
                bootstrap(store.as_ref(), &layout, &format!("10.0.0.{}", i)).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == BootstrapOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let marker = store.read_buffer(&layout.creator_path(), 0, 0).await.unwrap();
        assert!(String::from_utf8_lossy(&marker).starts_with("10.0.0."));
    }

    /// Store whose every operation fails.
    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn get_attr(&self, _path: &str) -> Result<crate::storage::ObjectAttr> {
            Err(Error::Store("permission denied".into()))
        }
        async fn create_dir(&self, _path: &str) -> Result<()> {
            Err(Error::Store("permission denied".into()))
        }
        async fn read_buffer(&self, _path: &str, _offset: u64, _length: u64) -> Result<Bytes> {
            Err(Error::Store("permission denied".into()))
        }
        async fn write_from_buffer(
            &self,
            _path: &str,
            _data: Bytes,
            _condition: WriteCondition,
        ) -> Result<crate::storage::ObjectAttr> {
            Err(Error::Store("permission denied".into()))
        }
        async fn list(&self, _dir: &str) -> Result<Vec<crate::storage::ObjectAttr>> {
            Err(Error::Store("permission denied".into()))
        }
    }

    #[tokio::test]
    async fn test_probe_failure_is_bootstrap_error() {
        let result = bootstrap(&BrokenStore, &CacheLayout::new("c1"), "10.0.0.1").await;
        assert_matches!(result, Err(Error::Bootstrap { ref stage, .. }) if stage.contains("probe"));
    }
}
