//! # KV Transport
//!
//! The narrow interface the sync loop needs from the distributed KV store,
//! plus two implementations:
//! - [`ConsulKv`]: Consul HTTP KV API with blocking queries
//! - [`MemoryKv`]: in-process store for tests and local development

pub mod consul;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use consul::ConsulKv;
pub use memory::MemoryKv;

/// Errors raised by a KV transport.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("KV transport error: {0}")]
    Transport(String),

    #[error("KV store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode KV response: {0}")]
    Decode(String),

    #[error("KV store unavailable")]
    Unavailable,
}

/// Entries under a prefix together with the store's version marker.
///
/// Keys are absolute (they include the prefix).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvSnapshot {
    pub entries: Vec<(String, String)>,
    pub version: u64,
}

/// Operations required from the remote KV store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads every entry under `prefix`.
    async fn fetch(&self, prefix: &str) -> Result<KvSnapshot, KvError>;

    /// Long-poll read: returns once the version moves past `since` or `wait`
    /// elapses, whichever comes first.
    async fn blocking_fetch(
        &self,
        prefix: &str,
        since: u64,
        wait: Duration,
    ) -> Result<KvSnapshot, KvError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError>;
}

/// Joins a prefix and a relative path with exactly one `/`.
pub fn join_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// Strips `prefix/` from an absolute key. Returns `None` for keys outside the
/// prefix or for the prefix folder itself.
pub fn relative_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    let rest = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
