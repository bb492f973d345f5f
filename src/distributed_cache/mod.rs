//! Distributed cache coordination
//!
//! Nodes that share a cache identity coordinate only through the object
//! store: the cache tree is created once, per-object metadata is updated with
//! etag compare-and-swap, and liveness is published as heartbeat records.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DistributedCache                         │
//! │  ┌────────────┐  ┌───────────────┐  ┌─────────────────────┐  │
//! │  │ bootstrap  │  │ MetadataStore │  │  HeartbeatManager   │  │
//! │  │ (once)     │  │ (CAS + retry) │  │  (periodic task)    │  │
//! │  └────────────┘  └───────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                  ObjectStore (shared by all nodes)
//! ```

pub mod bootstrap;
pub mod heartbeat;
pub mod loader;
pub mod metadata;
pub mod node;
pub mod retry;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

pub use bootstrap::{bootstrap, BootstrapOutcome, CacheLayout};
pub use heartbeat::{HeartbeatConfig, HeartbeatManager, HeartbeatRecord, PeerState, PeerStatus};
pub use loader::{BlockLoader, ChunkInfo};
pub use metadata::{LayoutEntry, MetadataDocument, MetadataStore, VersionedDocument};
pub use node::NodeIdentity;
pub use retry::{retry_on_conflict, RetryPolicy};

use crate::block_pool::BlockPool;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::storage::ObjectStore;

/// One node's membership in a distributed cache.
pub struct DistributedCache {
    config: CacheConfig,
    store: Arc<dyn ObjectStore>,
    identity: NodeIdentity,
    layout: CacheLayout,
    metadata: MetadataStore,
    heartbeat: HeartbeatManager,
    outcome: Mutex<Option<BootstrapOutcome>>,
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache").finish_non_exhaustive()
    }
}

impl DistributedCache {
    /// Wire up a node. Nothing touches the store until [`start`](Self::start).
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn ObjectStore>,
        identity: NodeIdentity,
    ) -> Result<Self> {
        config.validate()?;

        let layout = CacheLayout::new(config.cache_id.clone());
        let metadata = MetadataStore::new(Arc::clone(&store), layout.clone(), config.retry_policy());
        let heartbeat = HeartbeatManager::new(
            Arc::clone(&store),
            layout.clone(),
            identity.clone(),
            config.heartbeat_config(),
        );

        Ok(Self {
            config,
            store,
            identity,
            layout,
            metadata,
            heartbeat,
            outcome: Mutex::new(None),
        })
    }

    /// Bootstrap the shared tree and start heartbeating. A bootstrap failure
    /// is returned and nothing is started.
    pub async fn start(&self) -> Result<BootstrapOutcome> {
        let outcome = bootstrap(self.store.as_ref(), &self.layout, self.identity.address()).await?;
        self.heartbeat.start()?;
        *self.outcome.lock() = Some(outcome);

        info!(
            cache_id = self.layout.cache_id(),
            node_id = self.identity.node_id(),
            ?outcome,
            "Distributed cache started"
        );
        Ok(outcome)
    }

    /// Stop heartbeating.
    pub async fn stop(&self) -> Result<()> {
        self.heartbeat.stop().await?;
        self.outcome.lock().take();
        info!(cache_id = self.layout.cache_id(), "Distributed cache stopped");
        Ok(())
    }

    /// How the last `start` bootstrapped, `None` while stopped.
    pub fn bootstrap_outcome(&self) -> Option<BootstrapOutcome> {
        *self.outcome.lock()
    }

    /// Build a block pool and loader sized by the configuration. Must be
    /// called from within a tokio runtime.
    pub fn block_loader(&self) -> Result<BlockLoader> {
        let pool = Arc::new(BlockPool::new(self.config.block_size, self.config.memory_size)?);
        BlockLoader::new(Arc::clone(&self.store), pool, self.config.workers)
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn heartbeat(&self) -> &HeartbeatManager {
        &self.heartbeat
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }
}
