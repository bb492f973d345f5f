//! meshcache node
//!
//! Joins (or creates) a distributed cache on a directory-backed object store
//! and heartbeats until interrupted.
//!
//! ```text
//!  config file ─┐
//!  flags / env ─┴─▶ CacheConfig ──▶ DistributedCache::start ──▶ Ctrl-C ──▶ stop
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshcache::{CacheConfig, DistributedCache, LocalFsObjectStore, NodeIdentity};

// =============================================================================
// CLI Arguments
// =============================================================================

/// meshcache - distributed cache node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file with a `distributed_cache:` section
    #[arg(long, env = "MESHCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory of the shared object store
    #[arg(long, env = "MESHCACHE_STORE_ROOT")]
    store_root: PathBuf,

    /// Cache identity shared by all nodes
    #[arg(long, env = "MESHCACHE_CACHE_ID")]
    cache_id: Option<String>,

    /// Local cache directory
    #[arg(long, env = "MESHCACHE_PATH")]
    path: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[arg(long, env = "MESHCACHE_HEARTBEAT_DURATION")]
    heartbeat_duration: Option<u64>,

    /// Missed heartbeats before a peer is considered down
    #[arg(long, env = "MESHCACHE_MAX_MISSED_HEARTBEATS")]
    max_missed_heartbeats: Option<u32>,

    /// Replicas per chunk
    #[arg(long, env = "MESHCACHE_REPLICAS")]
    replicas: Option<u32>,

    /// Advertised cache capacity in bytes
    #[arg(long, env = "MESHCACHE_MAX_CACHE_SIZE")]
    max_cache_size: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File settings first, then flag overrides.
    fn cache_config(&self) -> anyhow::Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CacheConfig::default(),
        };

        if let Some(cache_id) = &self.cache_id {
            config.cache_id = cache_id.clone();
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(secs) = self.heartbeat_duration {
            config.heartbeat_duration = secs;
        }
        if let Some(max_missed) = self.max_missed_heartbeats {
            config.max_missed_heartbeats = max_missed;
        }
        if let Some(replicas) = self.replicas {
            config.replicas = replicas;
        }
        if let Some(size) = self.max_cache_size {
            config.max_cache_size = size;
        }

        config.validate().context("invalid distributed cache configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.cache_config()?;

    info!("Starting meshcache node");
    info!("  Cache id: {}", config.cache_id);
    info!("  Local path: {}", config.path.display());
    info!("  Store root: {}", args.store_root.display());
    info!("  Heartbeat: every {}s", config.heartbeat_duration);

    let store = LocalFsObjectStore::new(&args.store_root)
        .with_context(|| format!("opening store at {}", args.store_root.display()))?;
    let identity =
        NodeIdentity::load_or_create(&config.path).context("loading node identity")?;
    info!("  Node id: {} ({})", identity.node_id(), identity.address());

    let cache = DistributedCache::new(config, Arc::new(store), identity)?;
    let outcome = cache.start().await.context("starting distributed cache")?;
    info!("Cache ready ({:?})", outcome);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    cache.stop().await?;
    info!("meshcache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
