//! Configuration types for peerfs-tracker.
//! Parsed from a TOML file; command-line flags override individual fields.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub tracker: TrackerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Close a connection after this many consecutive idle timeouts.
    /// Unset keeps idle connections open indefinitely.
    #[serde(default)]
    pub idle_timeouts_before_close: Option<u32>,
    /// Drop and rebuild the inventory tables on start.
    #[serde(default = "default_reset_on_start")]
    pub reset_on_start: bool,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database: default_database(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            idle_timeouts_before_close: None,
            reset_on_start: default_reset_on_start(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9090".into()
}
fn default_database() -> String {
    "fs_tracker.sqlite".into()
}
fn default_max_connections() -> usize {
    5
}
fn default_idle_timeout_secs() -> u64 {
    peerfs_protocol::PARAMS_V1.tracker_idle_timeout_secs
}
fn default_reset_on_start() -> bool {
    true
}

impl TrackerConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: TrackerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
