//! peerfs Node -- library crate for the file-sharing node.
//!
//! Re-exports the tracker client, placement, controller and command modules
//! so integration tests and main.rs share them.

pub mod commands;
pub mod config;
pub mod control;
pub mod controller;
pub mod placement;

use std::path::PathBuf;

/// Expand ~ to home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
