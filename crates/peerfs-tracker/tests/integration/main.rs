//! Integration test entry point for peerfs-tracker.
//!
//! Run with: cargo test --test integration

mod harness;
mod locate;
mod lifecycle;
