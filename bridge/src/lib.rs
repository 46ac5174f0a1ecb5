//! # Revocation Bridge Library
//!
//! Keeps token revocation rules in sync with a distributed KV tree and
//! evaluates decoded claim sets against the latest snapshot.

// Core modules
pub mod config;
pub mod engine;
pub mod health;
pub mod kv;
pub mod refresh;
pub mod store;

// Re-export commonly used types
pub use config::{BridgeConfig, ConfigError};
pub use engine::{evaluate_index, RevocationEngine, StatsSnapshot, Verdict};
pub use health::HealthReport;
pub use kv::{ConsulKv, KvError, KvStore, MemoryKv};
pub use refresh::SyncConfig;
pub use store::{RuleStore, StoreError, SyncState};
