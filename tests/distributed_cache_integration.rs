//! Distributed Cache Integration Tests
//!
//! Several nodes sharing one object store:
//! - Bootstrap races on a fresh cache identity
//! - Concurrent metadata updates converging through CAS
//! - Heartbeat liveness between nodes
//! - Loading object ranges into pooled blocks

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use meshcache::distributed_cache::{LayoutEntry, PeerState};
use meshcache::{
    BootstrapOutcome, CacheConfig, DistributedCache, Error, InMemoryObjectStore,
    LocalFsObjectStore, NodeIdentity, ObjectStore, WriteCondition,
};

fn replicas(nodes: &[&str]) -> Map<String, Value> {
    match json!({ "size": "1024", "num-stripes": "4", "nodes": nodes }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn node(store: Arc<dyn ObjectStore>, cache_id: &str, node_id: &str, dir: &TempDir) -> DistributedCache {
    let mut config = CacheConfig::new(cache_id, dir.path().join(node_id));
    config.heartbeat_duration = 1;
    config.retry_backoff_ms = 1;
    config.retry_max_attempts = 200;
    config.block_size = 4096;
    config.memory_size = 4 * 4096;
    config.workers = 2;
    DistributedCache::new(
        config,
        store,
        NodeIdentity::new(node_id, format!("10.0.0.{}", node_id.len()), node_id),
    )
    .unwrap()
}

// =============================================================================
// Bootstrap
// =============================================================================

mod bootstrap_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_nodes_one_creator() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());

        let nodes: Vec<_> = (0..6)
            .map(|i| Arc::new(node(store.clone(), "race", &format!("n{}", i), &dir)))
            .collect();

        let mut handles = Vec::new();
        for n in &nodes {
            let n = Arc::clone(n);
            handles.push(tokio::spawn(async move { n.start().await }));
        }

        let mut created = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if outcome == BootstrapOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let entries = store.list("__CACHE__race").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["Nodes", "Objects", "creator.txt"]);

        for n in &nodes {
            n.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bootstrap_on_local_store() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalFsObjectStore::new(dir.path().join("store")).unwrap());

        let a = node(store.clone(), "disk", "a", &dir);
        let b = node(store.clone(), "disk", "b", &dir);
        assert_eq!(a.start().await.unwrap(), BootstrapOutcome::Created);
        assert_eq!(b.start().await.unwrap(), BootstrapOutcome::AlreadyInitialized);
        a.heartbeat().run_once().await.unwrap();

        assert!(dir.path().join("store/__CACHE__disk/creator.txt").is_file());
        assert!(dir.path().join("store/__CACHE__disk/Nodes/a.hb").is_file());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}

// =============================================================================
// Metadata
// =============================================================================

mod metadata_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_nodes_update_disjoint_chunks() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let nodes: Vec<_> = (0..4)
            .map(|i| Arc::new(node(store.clone(), "md", &format!("n{}", i), &dir)))
            .collect();
        nodes[0].start().await.unwrap();

        nodes[0]
            .metadata()
            .create_document("movie.mp4", Vec::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for (i, n) in nodes.iter().enumerate() {
            let n = Arc::clone(n);
            handles.push(tokio::spawn(async move {
                for chunk in 0..5 {
                    let chunk_id = format!("{}", i * 100 + chunk);
                    let owner = format!("n{}", i);
                    n.metadata()
                        .create_chunk_entry("movie.mp4", &chunk_id, replicas(&["n0"]))
                        .await?;
                    n.metadata()
                        .update_replica("movie.mp4", &chunk_id, replicas(&[owner.as_str()]))
                        .await?;
                }
                Ok::<_, Error>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let doc = nodes[0]
            .metadata()
            .read_document("movie.mp4")
            .await
            .unwrap()
            .document;
        assert_eq!(doc.layout.len(), 20);
        for i in 0..4 {
            for chunk in 0..5 {
                let entry = doc.chunk(&format!("{}", i * 100 + chunk)).unwrap();
                assert_eq!(entry.replicas["nodes"], json!([format!("n{}", i)]));
            }
        }

        nodes[0].stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_close_across_nodes() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let a = node(store.clone(), "md", "a", &dir);
        let b = node(store.clone(), "md", "b", &dir);

        a.metadata()
            .create_document("f", vec![LayoutEntry::new("0", replicas(&["a"]))])
            .await
            .unwrap();

        a.metadata().open_document("f").await.unwrap();
        let doc = b.metadata().open_document("f").await.unwrap();
        assert_eq!(doc.open_count, 2);

        a.metadata().close_document("f").await.unwrap();
        let doc = b.metadata().close_document("f").await.unwrap();
        assert_eq!(doc.open_count, 0);

        assert!(matches!(
            b.metadata().update_replica("f", "7", replicas(&["b"])).await,
            Err(Error::ChunkNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_document_format_on_disk() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalFsObjectStore::new(dir.path().join("store")).unwrap());
        let a = node(store.clone(), "fmt", "a", &dir);
        a.start().await.unwrap();

        a.metadata()
            .create_document("obj", vec![LayoutEntry::new("0", replicas(&["a"]))])
            .await
            .unwrap();
        a.metadata().open_document("obj").await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("store/__CACHE__fmt/Objects/obj")).unwrap();
        assert!(text.starts_with("{\n    \"open-count\": 1"));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["layout"][0]["chunk-id"], json!("0"));

        a.stop().await.unwrap();
    }
}

// =============================================================================
// Heartbeats
// =============================================================================

mod heartbeat_tests {
    use super::*;

    /// Two bootstrapped nodes whose background loops are stopped, so the
    /// tests drive every tick by hand.
    async fn quiet_pair(store: &Arc<dyn ObjectStore>, dir: &TempDir) -> (DistributedCache, DistributedCache) {
        let a = node(store.clone(), "hb", "a", dir);
        let b = node(store.clone(), "hb", "b", dir);
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.stop().await.unwrap();
        b.stop().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_nodes_see_each_other() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let (a, b) = quiet_pair(&store, &dir).await;

        a.heartbeat().run_once().await.unwrap();
        b.heartbeat().run_once().await.unwrap();
        a.heartbeat().run_once().await.unwrap();

        assert!(a.heartbeat().is_node_up("b"));
        assert!(b.heartbeat().is_node_up("a"));
        assert_eq!(a.heartbeat().live_nodes(), vec!["a", "b"]);
        assert_eq!(b.heartbeat().live_nodes(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_silent_node_goes_down() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let (a, b) = quiet_pair(&store, &dir).await;

        a.heartbeat().run_once().await.unwrap();
        b.heartbeat().run_once().await.unwrap();
        assert!(b.heartbeat().is_node_up("a"));

        // Default tolerance is one missed heartbeat.
        b.heartbeat().run_once().await.unwrap();
        assert!(b.heartbeat().is_node_up("a"));
        b.heartbeat().run_once().await.unwrap();
        assert!(!b.heartbeat().is_node_up("a"));
        assert_eq!(b.heartbeat().peers()[0].state, PeerState::Down);
        assert_eq!(b.heartbeat().live_nodes(), vec!["b"]);

        // Publishing again brings it back.
        a.heartbeat().run_once().await.unwrap();
        b.heartbeat().run_once().await.unwrap();
        assert!(b.heartbeat().is_node_up("a"));
    }

    #[tokio::test]
    async fn test_background_loop_publishes() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let a = node(store.clone(), "loop", "a", &dir);
        a.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = store.read_buffer("__CACHE__loop/Nodes/a.hb", 0, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let second = store.read_buffer("__CACHE__loop/Nodes/a.hb", 0, 0).await.unwrap();
        assert_ne!(first, second);

        a.stop().await.unwrap();
    }
}

// =============================================================================
// Loading
// =============================================================================

mod loader_tests {
    use super::*;

    #[tokio::test]
    async fn test_load_object_through_pool() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalFsObjectStore::new(dir.path().join("store")).unwrap());
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
        store
            .write_from_buffer(
                "__CACHE__load/Objects/data.bin",
                Bytes::from(payload.clone()),
                WriteCondition::None,
            )
            .await
            .unwrap();

        let a = node(store.clone(), "load", "a", &dir);
        let loader = a.block_loader().unwrap();
        assert_eq!(loader.pool().max_blocks(), 4);

        let mut rx = loader
            .load("__CACHE__load/Objects/data.bin", 0, 0)
            .await
            .unwrap();
        let mut pieces = Vec::new();
        while let Some(block) = rx.recv().await {
            let block = block.unwrap();
            pieces.push((block.offset(), block.filled().to_vec()));
            loader.pool().release_block(block).unwrap();
        }
        pieces.sort_by_key(|(offset, _)| *offset);

        assert_eq!(pieces.len(), 5);
        let joined: Vec<u8> = pieces.into_iter().flat_map(|(_, bytes)| bytes).collect();
        assert_eq!(joined, payload);

        loader.shutdown().await.unwrap();
        assert_eq!(loader.pool().usage(), 0);
    }
}
