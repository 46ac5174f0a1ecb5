//! # Rule Sync
//!
//! Watching the KV tree and keeping the store's snapshot current:
//! - `watcher`: long-poll reads turned into change events
//! - `scheduler`: the background loop and its staleness ceiling
//! - `backoff`: retry delays for transport errors

pub mod backoff;
pub mod scheduler;
pub mod watcher;

pub use backoff::Backoff;
pub use scheduler::{run_sync_loop, SyncConfig};
pub use watcher::{TreeWatcher, WatchHealth};
