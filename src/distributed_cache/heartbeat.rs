//! Node heartbeats and peer liveness
//!
//! Every node periodically overwrites its own record under `Nodes/` and then
//! reads everyone else's. Liveness is judged from the record's `sequence`,
//! which the owner bumps on every publish, so no clock agreement between
//! nodes is needed.
//!
//! ```text
//!  tick ──▶ publish Nodes/<self>.hb ──▶ list Nodes/ ──▶ read peers ──▶ update
//!
//!  per peer:  sequence changed  → Up, missed = 0
//!             otherwise         → missed += 1
//!             missed > max      → Down
//! ```
//!
//! A record that vanished or cannot be parsed counts as a miss.
//!
//! The first time a peer is seen there is no earlier sequence to compare
//! against, so its `last-heartbeat` decides: a record older than the
//! tolerated silence starts out Down and comes up once its sequence moves.
//! Peers whose records stay gone are forgotten after a while.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bootstrap::CacheLayout;
use super::node::{disk_usage, NodeIdentity};
use crate::error::{Error, Result};
use crate::storage::{ObjectStore, WriteCondition};

/// Default publish interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default misses tolerated before a peer is Down
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 1;

/// Ticks a Down peer without a record is kept before it is forgotten
pub const EVICT_AFTER_DOWN_TICKS: u32 = 10;

// =============================================================================
// Records
// =============================================================================

/// Heartbeat record stored at `Nodes/<nodeId>.hb`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HeartbeatRecord {
    pub node_id: String,
    pub address: String,
    pub hostname: String,
    /// Unix seconds at publish time
    pub last_heartbeat: i64,
    /// Bumped on every publish
    pub sequence: u64,
    /// Configured cache capacity in bytes
    pub total_space: u64,
    /// Bytes used under the local cache path
    pub used_space: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Up,
    Down,
}

/// What this node currently believes about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub node_id: String,
    pub address: String,
    pub hostname: String,
    pub last_sequence: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Consecutive ticks without progress
    pub missed: u32,
    pub state: PeerState,
}

impl PeerStatus {
    fn from_record(record: &HeartbeatRecord) -> Self {
        Self {
            node_id: record.node_id.clone(),
            address: record.address.clone(),
            hostname: record.hostname.clone(),
            last_sequence: record.sequence,
            last_heartbeat: Utc.timestamp_opt(record.last_heartbeat, 0).single(),
            missed: 0,
            state: PeerState::Up,
        }
    }

    /// Status for a peer seen for the first time at `now`. A record that
    /// has not been refreshed for longer than `stale_after` starts Down.
    pub fn discovered(
        record: &HeartbeatRecord,
        max_missed: u32,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut status = Self::from_record(record);
        if is_stale(record.last_heartbeat, stale_after, now) {
            status.missed = max_missed.saturating_add(1);
            status.state = PeerState::Down;
        }
        status
    }

    /// Fold one tick's observation into the status, returning the new state
    /// if it changed. `None` means no usable record was seen this tick.
    pub fn observe(&mut self, record: Option<&HeartbeatRecord>, max_missed: u32) -> Option<PeerState> {
        let previous = self.state;

        match record {
            Some(record) if record.sequence != self.last_sequence => {
                self.address = record.address.clone();
                self.hostname = record.hostname.clone();
                self.last_sequence = record.sequence;
                self.last_heartbeat = Utc.timestamp_opt(record.last_heartbeat, 0).single();
                self.missed = 0;
                self.state = PeerState::Up;
            }
            _ => {
                self.missed = self.missed.saturating_add(1);
                if self.missed > max_missed {
                    self.state = PeerState::Down;
                }
            }
        }

        (self.state != previous).then_some(self.state)
    }
}

/// Whether a record stamped `last_heartbeat` (unix seconds) is older than
/// `stale_after`. Stamps have whole-second resolution, so one extra second
/// is allowed. A stamp from the future is never stale.
fn is_stale(last_heartbeat: i64, stale_after: Duration, now: DateTime<Utc>) -> bool {
    let age = now.timestamp().saturating_sub(last_heartbeat);
    let limit = i64::try_from(stale_after.as_secs_f64().ceil() as u64)
        .unwrap_or(i64::MAX)
        .saturating_add(1);
    age > limit
}

// =============================================================================
// Manager
// =============================================================================

/// Heartbeat settings
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub max_missed: u32,
    /// Advertised capacity
    pub total_space: u64,
    /// Local directory whose usage is advertised
    pub cache_path: Option<PathBuf>,
}

impl HeartbeatConfig {
    /// Silence after which a peer's record no longer counts as fresh.
    pub fn stale_after(&self) -> Duration {
        self.interval.saturating_mul(self.max_missed.max(1))
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
            total_space: 0,
            cache_path: None,
        }
    }
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    layout: CacheLayout,
    identity: NodeIdentity,
    config: HeartbeatConfig,
    sequence: AtomicU64,
    peers: RwLock<HashMap<String, PeerStatus>>,
}

/// Publishes this node's heartbeat and tracks peers.
pub struct HeartbeatManager {
    inner: Arc<Inner>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HeartbeatManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: CacheLayout,
        identity: NodeIdentity,
        config: HeartbeatConfig,
    ) -> Self {
        // Seeded from the clock so a restarted node never repeats the
        // sequence peers last saw from it.
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);

        Self {
            inner: Arc::new(Inner {
                store,
                layout,
                identity,
                config,
                sequence: AtomicU64::new(seed),
                peers: RwLock::new(HashMap::new()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        self.inner.identity.node_id()
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.inner.config
    }

    /// Start the periodic loop. The first tick runs immediately.
    pub fn start(&self) -> Result<()> {
        let period = self.inner.config.interval;
        if period.is_zero() {
            return Err(Error::Config("heartbeat-duration must be greater than 0".into()));
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Err(Error::HeartbeatState("already running"));
        }

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = inner.tick().await {
                            warn!("Heartbeat tick failed: {}", e);
                        }
                    }
                }
            }
            debug!("Heartbeat loop exited");
        });

        *task = Some((token, handle));
        info!(
            node_id = self.node_id(),
            interval = ?period,
            max_missed = self.inner.config.max_missed,
            "Heartbeat started"
        );
        Ok(())
    }

    /// Stop the loop and wait for it. An in-flight tick finishes first and
    /// nothing is published after this returns.
    pub async fn stop(&self) -> Result<()> {
        let Some((token, handle)) = self.task.lock().take() else {
            return Ok(());
        };

        token.cancel();
        handle
            .await
            .map_err(|e| Error::Internal(format!("heartbeat task failed: {}", e)))?;
        info!(node_id = self.node_id(), "Heartbeat stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run one publish-and-scan cycle.
    pub async fn run_once(&self) -> Result<()> {
        self.inner.tick().await
    }

    /// Known peers, sorted by node id.
    pub fn peers(&self) -> Vec<PeerStatus> {
        let mut peers: Vec<_> = self.inner.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Whether `node_id` is considered alive. This node counts as alive.
    pub fn is_node_up(&self, node_id: &str) -> bool {
        if node_id == self.node_id() {
            return true;
        }
        self.inner
            .peers
            .read()
            .get(node_id)
            .is_some_and(|p| p.state == PeerState::Up)
    }

    /// This node plus every peer that is Up, sorted.
    pub fn live_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .inner
            .peers
            .read()
            .values()
            .filter(|p| p.state == PeerState::Up)
            .map(|p| p.node_id.clone())
            .collect();
        nodes.push(self.node_id().to_string());
        nodes.sort();
        nodes
    }
}

impl Inner {
    async fn tick(&self) -> Result<()> {
        let published = self.publish().await;
        if let Err(e) = &published {
            warn!("Failed to publish heartbeat: {}", e);
        }
        self.scan_peers().await?;
        published
    }

    async fn publish(&self) -> Result<()> {
        let used_space = match self.config.cache_path.clone() {
            Some(path) => tokio::task::spawn_blocking(move || disk_usage(&path))
                .await
                .unwrap_or(0),
            None => 0,
        };

        let record = HeartbeatRecord {
            node_id: self.identity.node_id().to_string(),
            address: self.identity.address().to_string(),
            hostname: self.identity.hostname().to_string(),
            last_heartbeat: Utc::now().timestamp(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            total_space: self.config.total_space,
            used_space,
        };

        let path = self.layout.heartbeat_path(self.identity.node_id());
        let body = Bytes::from(serde_json::to_vec_pretty(&record)?);
        self.store
            .write_from_buffer(&path, body, WriteCondition::None)
            .await?;
        debug!(sequence = record.sequence, "Published heartbeat");
        Ok(())
    }

    async fn scan_peers(&self) -> Result<()> {
        let entries = self.store.list(&self.layout.nodes_dir()).await?;

        let mut seen: HashMap<String, Option<HeartbeatRecord>> = HashMap::new();
        for entry in entries.iter().filter(|e| !e.is_dir) {
            let Some(node_id) = CacheLayout::node_id_from_record(entry.name()) else {
                continue;
            };
            if node_id == self.identity.node_id() {
                continue;
            }

            let record = match self.store.read_buffer(&entry.path, 0, 0).await {
                Ok(data) => match serde_json::from_slice::<HeartbeatRecord>(&data) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(peer = node_id, "Unparsable heartbeat record: {}", e);
                        None
                    }
                },
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            seen.insert(node_id.to_string(), record);
        }

        let max_missed = self.config.max_missed;
        let evict_after = max_missed.saturating_add(EVICT_AFTER_DOWN_TICKS);
        let mut peers = self.peers.write();

        peers.retain(|node_id, status| {
            let listed = seen.contains_key(node_id);
            let record = seen.remove(node_id).flatten();
            match status.observe(record.as_ref(), max_missed) {
                Some(PeerState::Up) => info!(peer = %node_id, "Peer is back up"),
                Some(PeerState::Down) => {
                    warn!(peer = %node_id, missed = status.missed, "Peer is down")
                }
                None => {}
            }

            if !listed && status.state == PeerState::Down && status.missed > evict_after {
                info!(peer = %node_id, "Forgetting peer without a heartbeat record");
                return false;
            }
            true
        });

        // First sighting of a peer.
        let now = Utc::now();
        let stale_after = self.config.stale_after();
        for (node_id, record) in seen {
            if let Some(record) = record {
                let status = PeerStatus::discovered(&record, max_missed, stale_after, now);
                if status.state == PeerState::Down {
                    warn!(
                        peer = %node_id,
                        last_heartbeat = record.last_heartbeat,
                        "Discovered peer with a stale heartbeat"
                    );
                } else {
                    info!(peer = %node_id, address = %record.address, "Discovered peer");
                }
                peers.insert(node_id, status);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn manager(store: &Arc<InMemoryObjectStore>, node_id: &str, max_missed: u32) -> HeartbeatManager {
        HeartbeatManager::new(
            store.clone(),
            CacheLayout::new("hb"),
            NodeIdentity::new(node_id, "10.0.0.1", "host"),
            HeartbeatConfig {
                interval: Duration::from_millis(20),
                max_missed,
                total_space: 1 << 30,
                cache_path: None,
            },
        )
    }

    async fn store_with_tree() -> Arc<InMemoryObjectStore> {
        let store = Arc::new(InMemoryObjectStore::new());
        store.create_dir("__CACHE__hb/Nodes").await.unwrap();
        store
    }

    async fn read_record(store: &InMemoryObjectStore, node_id: &str) -> HeartbeatRecord {
        let data = store
            .read_buffer(&format!("__CACHE__hb/Nodes/{}.hb", node_id), 0, 0)
            .await
            .unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    #[tokio::test]
    async fn test_publish_record() {
        let store = store_with_tree().await;
        let hb = manager(&store, "a", 1);

        hb.run_once().await.unwrap();
        let first = read_record(&store, "a").await;
        assert_eq!(first.node_id, "a");
        assert_eq!(first.address, "10.0.0.1");
        assert_eq!(first.total_space, 1 << 30);

        hb.run_once().await.unwrap();
        let second = read_record(&store, "a").await;
        assert!(second.sequence > first.sequence);
        assert!(second.last_heartbeat >= first.last_heartbeat);
    }

    #[tokio::test]
    async fn test_record_uses_kebab_case_keys() {
        let store = store_with_tree().await;
        manager(&store, "a", 1).run_once().await.unwrap();

        let data = store.read_buffer("__CACHE__hb/Nodes/a.hb", 0, 0).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        for key in ["node-id", "last-heartbeat", "total-space", "used-space", "sequence"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_peer_goes_down_and_recovers() {
        let store = store_with_tree().await;
        let a = manager(&store, "a", 1);
        let b = manager(&store, "b", 1);

        a.run_once().await.unwrap();
        b.run_once().await.unwrap();
        assert!(b.is_node_up("a"));
        assert_eq!(b.live_nodes(), vec!["a".to_string(), "b".to_string()]);

        // a stops publishing: one miss is tolerated, the second is not.
        b.run_once().await.unwrap();
        assert!(b.is_node_up("a"));
        assert_eq!(b.peers()[0].missed, 1);

        b.run_once().await.unwrap();
        assert!(!b.is_node_up("a"));
        assert_eq!(b.peers()[0].state, PeerState::Down);
        assert_eq!(b.live_nodes(), vec!["b".to_string()]);

        a.run_once().await.unwrap();
        b.run_once().await.unwrap();
        assert!(b.is_node_up("a"));
        assert_eq!(b.peers()[0].missed, 0);
    }

    #[tokio::test]
    async fn test_vanished_and_corrupt_records_are_misses() {
        let store = store_with_tree().await;
        let a = manager(&store, "a", 0);
        let c = manager(&store, "c", 0);
        let b = manager(&store, "b", 0);

        a.run_once().await.unwrap();
        c.run_once().await.unwrap();
        b.run_once().await.unwrap();
        assert!(b.is_node_up("a"));
        assert!(b.is_node_up("c"));

        assert!(store.remove("__CACHE__hb/Nodes/a.hb"));
        store
            .write_from_buffer(
                "__CACHE__hb/Nodes/c.hb",
                Bytes::from_static(b"garbage"),
                WriteCondition::None,
            )
            .await
            .unwrap();

        b.run_once().await.unwrap();
        assert!(!b.is_node_up("a"));
        assert!(!b.is_node_up("c"));
    }

    async fn write_record(store: &InMemoryObjectStore, node_id: &str, last_heartbeat: i64, sequence: u64) {
        let record = HeartbeatRecord {
            node_id: node_id.into(),
            address: "10.0.0.9".into(),
            hostname: "gone".into(),
            last_heartbeat,
            sequence,
            total_space: 0,
            used_space: 0,
        };
        store
            .write_from_buffer(
                &format!("__CACHE__hb/Nodes/{}.hb", node_id),
                Bytes::from(serde_json::to_vec(&record).unwrap()),
                WriteCondition::None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_record_is_down_on_first_sight() {
        let store = store_with_tree().await;
        let week_ago = (Utc::now() - chrono::Duration::days(7)).timestamp();
        write_record(&store, "dead", week_ago, 5).await;

        let b = manager(&store, "b", 1);
        b.run_once().await.unwrap();
        assert!(!b.is_node_up("dead"));
        assert_eq!(b.live_nodes(), vec!["b".to_string()]);
        assert_eq!(b.peers()[0].state, PeerState::Down);

        // A restarted owner bumps the sequence and is believed again.
        write_record(&store, "dead", Utc::now().timestamp(), 6).await;
        b.run_once().await.unwrap();
        assert!(b.is_node_up("dead"));
        assert_eq!(b.live_nodes(), vec!["b".to_string(), "dead".to_string()]);
    }

    #[tokio::test]
    async fn test_fresh_record_is_up_on_first_sight() {
        let store = store_with_tree().await;
        write_record(&store, "a", Utc::now().timestamp(), 1).await;

        let b = manager(&store, "b", 1);
        b.run_once().await.unwrap();
        assert!(b.is_node_up("a"));
    }

    #[tokio::test]
    async fn test_peer_without_record_is_forgotten() {
        let store = store_with_tree().await;
        let a = manager(&store, "a", 0);
        let b = manager(&store, "b", 0);

        a.run_once().await.unwrap();
        b.run_once().await.unwrap();
        assert_eq!(b.peers().len(), 1);

        assert!(store.remove("__CACHE__hb/Nodes/a.hb"));
        for _ in 0..EVICT_AFTER_DOWN_TICKS {
            b.run_once().await.unwrap();
            assert_eq!(b.peers().len(), 1);
        }
        assert!(!b.is_node_up("a"));

        b.run_once().await.unwrap();
        assert!(b.peers().is_empty());

        // Publishing again makes it a new peer.
        a.run_once().await.unwrap();
        b.run_once().await.unwrap();
        assert!(b.is_node_up("a"));
    }

    #[test]
    fn test_staleness_threshold() {
        let now = Utc::now();
        let thirty = Duration::from_secs(30);
        assert!(!is_stale(now.timestamp(), thirty, now));
        assert!(!is_stale(now.timestamp() - 31, thirty, now));
        assert!(is_stale(now.timestamp() - 32, thirty, now));
        assert!(!is_stale(now.timestamp() + 600, thirty, now));

        let config = HeartbeatConfig {
            interval: thirty,
            max_missed: 3,
            ..Default::default()
        };
        assert_eq!(config.stale_after(), Duration::from_secs(90));
        let config = HeartbeatConfig {
            max_missed: 0,
            ..config
        };
        assert_eq!(config.stale_after(), thirty);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let store = store_with_tree().await;
        let hb = HeartbeatManager::new(
            store.clone(),
            CacheLayout::new("hb"),
            NodeIdentity::new("a", "10.0.0.1", "host"),
            HeartbeatConfig {
                interval: Duration::ZERO,
                ..Default::default()
            },
        );
        assert_matches!(hb.start(), Err(Error::Config(_)));
        assert!(!hb.is_running());

        let hb = manager(&store, "a", 1);
        hb.start().unwrap();
        assert_matches!(hb.start(), Err(Error::HeartbeatState(_)));
        hb.stop().await.unwrap();
        assert!(!hb.is_running());
        // Stopping twice is harmless.
        hb.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_publish_after_stop() {
        let store = store_with_tree().await;
        let hb = manager(&store, "a", 1);

        hb.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        hb.stop().await.unwrap();

        let at_stop = read_record(&store, "a").await.sequence;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(read_record(&store, "a").await.sequence, at_stop);

        // Restartable.
        hb.start().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        hb.stop().await.unwrap();
        assert!(read_record(&store, "a").await.sequence > at_stop);
    }

    #[tokio::test]
    async fn test_tick_errors_do_not_stop_loop() {
        // No Nodes/ directory: every scan fails, publishes still land.
        let store = Arc::new(InMemoryObjectStore::new());
        let hb = manager(&store, "a", 1);
        assert!(hb.run_once().await.is_err());

        hb.start().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(hb.is_running());
        hb.stop().await.unwrap();
        assert!(read_record(&store, "a").await.sequence > 0);
    }

    fn peer() -> PeerStatus {
        PeerStatus::from_record(&HeartbeatRecord {
            node_id: "p".into(),
            address: "10.0.0.2".into(),
            hostname: "h".into(),
            last_heartbeat: 0,
            sequence: 1,
            total_space: 0,
            used_space: 0,
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_down_iff_misses_exceed_limit(
            max_missed in 0u32..4,
            progress in proptest::collection::vec(any::<bool>(), 1..40),
        ) {
            let mut status = peer();
            let mut sequence = 1u64;
            let mut run = 0u32;

            for advanced in progress {
                let record = if advanced {
                    sequence += 1;
                    Some(HeartbeatRecord {
                        node_id: "p".into(),
                        address: "10.0.0.2".into(),
                        hostname: "h".into(),
                        last_heartbeat: sequence as i64,
                        sequence,
                        total_space: 0,
                        used_space: 0,
                    })
                } else {
                    None
                };
                status.observe(record.as_ref(), max_missed);

                run = if advanced { 0 } else { run + 1 };
                prop_assert_eq!(status.missed, run);
                prop_assert_eq!(status.state == PeerState::Down, run > max_missed);
            }
        }
    }
}
