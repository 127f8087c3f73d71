//! peerfs Tracker -- the bookkeeping service nodes report their holdings to.
//!
//! One task per accepted connection decodes requests with the tracker codec,
//! applies them to the inventory and answers in arrival order. Whatever ends
//! a session, the host's inventory is purged once its last open session closes.

pub mod config;
pub mod locate;
pub mod server;
pub mod session;

pub use server::TrackerServer;
pub use session::{run_session, LiveHosts, SessionConfig, SessionEnd};
