//! Local node identity
//!
//! A node is identified by a UUID persisted under its local cache path, so
//! restarts keep the same heartbeat record on the shared store.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;

/// File under the local cache path holding the node id
pub const NODE_ID_FILE: &str = ".node-id";

/// Who this node is and how peers can reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    node_id: String,
    address: String,
    hostname: String,
}

impl NodeIdentity {
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            hostname: hostname.into(),
        }
    }

    /// Read the node id from `<cache_path>/.node-id`, generating and
    /// persisting a new one on first start.
    pub fn load_or_create(cache_path: &Path) -> Result<Self> {
        fs::create_dir_all(cache_path)?;
        let id_file = cache_path.join(NODE_ID_FILE);

        let node_id = match fs::read_to_string(&id_file) {
            Ok(existing) if !existing.trim().is_empty() => {
                debug!(file = %id_file.display(), "Loaded node id");
                existing.trim().to_string()
            }
            Ok(_) => create_node_id(&id_file)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => create_node_id(&id_file)?,
            Err(e) => return Err(e.into()),
        };

        Ok(Self::new(node_id, local_address(), hostname()))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

fn create_node_id(id_file: &Path) -> Result<String> {
    let node_id = uuid::Uuid::new_v4().to_string();
    fs::write(id_file, &node_id)?;
    info!(node_id = %node_id, "Generated new node id");
    Ok(node_id)
}

/// IP of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route, no packet is sent. Falls
/// back to loopback when there is no route.
pub fn local_address() -> String {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip.to_string(),
        _ => Ipv4Addr::LOCALHOST.to_string(),
    }
}

pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Bytes used by regular files under `path`; unreadable entries count as 0.
pub fn disk_usage(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };

    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => disk_usage(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
