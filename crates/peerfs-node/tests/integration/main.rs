//! Integration test entry point for peerfs-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod download;
mod tracker_ops;
