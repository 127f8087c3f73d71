//! Configuration types for peerfs-node.
//! Parsed from a TOML file; command-line flags override individual fields.

use peerfs_transfer::TransferConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Storage root: `files/`, `blocks/` and `hashes/` live below it.
    #[serde(default = "default_directory")]
    pub directory: String,
    /// Division size used when dividing local files, and preferred when
    /// several division sizes are equally available.
    #[serde(default = "default_block_size")]
    pub block_size: u16,
    #[serde(default = "default_tracker_addr")]
    pub tracker_addr: String,
    /// Local UDP address for block transfers.
    #[serde(default = "default_udp_addr")]
    pub udp_addr: String,
    /// UDP port assumed for peers whose identity carries no port.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            block_size: default_block_size(),
            tracker_addr: default_tracker_addr(),
            udp_addr: default_udp_addr(),
            peer_port: default_peer_port(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

fn default_directory() -> String {
    "~/.peerfs".into()
}
fn default_block_size() -> u16 {
    1024
}
fn default_tracker_addr() -> String {
    "127.0.0.1:9090".into()
}
fn default_udp_addr() -> String {
    "0.0.0.0:9090".into()
}
fn default_peer_port() -> u16 {
    9090
}
fn default_read_timeout_secs() -> u64 {
    peerfs_protocol::PARAMS_V1.node_read_timeout_secs
}

impl NodeSection {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
