//! In-process KV store with Consul-like versioning and blocking reads.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use super::{KvError, KvSnapshot, KvStore};

struct MemoryState {
    entries: BTreeMap<String, String>,
    version: u64,
    available: bool,
}

/// Versioned in-memory KV tree.
///
/// Every write bumps a store-wide version and wakes blocked readers. The
/// outage switch and [`MemoryKv::reset_version`] let tests exercise the
/// watcher's failure paths.
pub struct MemoryKv {
    state: Mutex<MemoryState>,
    version_tx: watch::Sender<u64>,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(1);
        MemoryKv {
            state: Mutex::new(MemoryState {
                entries: BTreeMap::new(),
                version: 1,
                available: true,
            }),
            version_tx,
        }
    }

    /// Current store version.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Simulates an outage (`false`) or recovery (`true`). Blocked readers
    /// are woken so they observe the change.
    pub fn set_available(&self, available: bool) {
        let version = {
            let mut state = self.state.lock();
            state.available = available;
            state.version
        };
        self.version_tx.send_replace(version);
    }

    /// Forces the version marker to `version`, as a restored cluster would.
    pub fn reset_version(&self, version: u64) {
        {
            let mut state = self.state.lock();
            state.version = version;
        }
        self.version_tx.send_replace(version);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(state: &MemoryState, prefix: &str) -> KvSnapshot {
        KvSnapshot {
            entries: state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            version: state.version,
        }
    }

    fn write(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), KvError> {
        let version = {
            let mut state = self.state.lock();
            if !state.available {
                return Err(KvError::Unavailable);
            }
            apply(&mut state.entries);
            state.version += 1;
            state.version
        };
        self.version_tx.send_replace(version);
        Ok(())
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn fetch(&self, prefix: &str) -> Result<KvSnapshot, KvError> {
        let state = self.state.lock();
        if !state.available {
            return Err(KvError::Unavailable);
        }
        Ok(Self::snapshot(&state, prefix))
    }

    async fn blocking_fetch(
        &self,
        prefix: &str,
        since: u64,
        wait: Duration,
    ) -> Result<KvSnapshot, KvError> {
        let mut version_rx = self.version_tx.subscribe();
        let deadline = Instant::now() + wait;

        loop {
            {
                let state = self.state.lock();
                if !state.available {
                    return Err(KvError::Unavailable);
                }
                if state.version != since {
                    return Ok(Self::snapshot(&state, prefix));
                }
            }

            match timeout_at(deadline, version_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(KvError::Unavailable),
                Err(_elapsed) => return self.fetch(prefix).await,
            }
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.write(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError> {
        self.write(|entries| {
            if recursive {
                entries.retain(|k, _| !k.starts_with(key));
            } else {
                entries.remove(key);
            }
        })
    }
}
