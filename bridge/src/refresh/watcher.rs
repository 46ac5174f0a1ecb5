//! KV tree watcher - turns long-poll reads into typed change events.
//!
//! Each cycle issues a blocking read with the last seen version, diffs the
//! returned tree against the known paths and queues `Added` / `Updated` /
//! `Removed` events. Transport errors back off exponentially; after enough
//! consecutive failures, or when the remote version moves backwards, the
//! watcher falls back to a full fetch and emits `Resynced`.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use rule_engine::ChangeEvent;

use super::backoff::Backoff;
use super::scheduler::SyncConfig;
use crate::kv::{relative_key, KvError, KvSnapshot, KvStore};

// ================================================================================================
// WATCH HEALTH
// ================================================================================================

#[derive(Debug, Default)]
struct HealthInner {
    last_success: Option<Instant>,
    consecutive_failures: u32,
    total_failures: u64,
    last_error: Option<String>,
}

/// Outcome of recent watch cycles, shared between the watcher and the store.
#[derive(Debug, Default)]
pub struct WatchHealth {
    inner: Mutex<HealthInner>,
}

impl WatchHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed read (incremental or full).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_success = Some(Instant::now());
        inner.consecutive_failures = 0;
        inner.last_error = None;
    }

    /// Records a failed read and returns the consecutive failure count.
    pub fn record_failure(&self, error: &KvError) -> u32 {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures += 1;
        inner.last_error = Some(error.to_string());
        inner.consecutive_failures
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.inner.lock().last_success
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.inner.lock().total_failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }
}

// ================================================================================================
// TREE WATCHER
// ================================================================================================

/// Watches one KV prefix and yields [`ChangeEvent`]s on demand.
///
/// The watcher starts in full-fetch mode, so the first event is always
/// `Resynced`. All waits are abandoned as soon as the shutdown flag flips.
pub struct TreeWatcher {
    kv: Arc<dyn KvStore>,
    prefix: String,
    config: SyncConfig,
    backoff: Backoff,
    known: BTreeMap<String, String>,
    version: u64,
    needs_resync: bool,
    pending: VecDeque<ChangeEvent>,
    health: Arc<WatchHealth>,
    shutdown: watch::Receiver<bool>,
}

impl TreeWatcher {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        config: SyncConfig,
        health: Arc<WatchHealth>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        TreeWatcher {
            kv,
            prefix: prefix.into(),
            config,
            backoff,
            known: BTreeMap::new(),
            version: 0,
            needs_resync: true,
            pending: VecDeque::new(),
            health,
            shutdown,
        }
    }

    /// Last version marker seen from the store.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of paths currently known under the prefix.
    pub fn known_paths(&self) -> usize {
        self.known.len()
    }

    /// True once shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Waits for the next change. Returns `None` once shutdown is requested.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.is_cancelled() {
                return None;
            }

            if self.needs_resync {
                match self.resync().await? {
                    Ok(event) => return Some(event),
                    Err(_) => {
                        if !self.back_off().await {
                            return None;
                        }
                        continue;
                    }
                }
            }

            let kv = Arc::clone(&self.kv);
            let read = kv.blocking_fetch(&self.prefix, self.version, self.config.watch_timeout);
            match cancellable(&mut self.shutdown, read).await? {
                Ok(snapshot) => self.absorb(snapshot),
                Err(e) => {
                    let failures = self.health.record_failure(&e);
                    warn!(
                        "Watch on '{}' failed ({} consecutive): {}",
                        self.prefix, failures, e
                    );
                    if failures >= self.config.resync_after_failures
                        || self.backoff.is_capped(failures)
                    {
                        self.needs_resync = true;
                    }
                    if !self.back_off().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Full fetch of the prefix. Returns `None` if cancelled.
    ///
    /// On success the known tree and version marker are replaced and pending
    /// incremental events are discarded.
    pub async fn resync(&mut self) -> Option<Result<ChangeEvent, KvError>> {
        let kv = Arc::clone(&self.kv);
        let fetched = cancellable(&mut self.shutdown, kv.fetch(&self.prefix)).await?;

        match fetched {
            Ok(snapshot) => {
                let version = snapshot.version;
                let entries = self.relative_entries(snapshot);
                self.known = entries.iter().cloned().collect();
                self.version = version;
                self.needs_resync = false;
                self.pending.clear();
                self.health.record_success();
                info!(
                    "Resynced '{}' at version {}: {} entries",
                    self.prefix,
                    version,
                    entries.len()
                );
                Some(Ok(ChangeEvent::Resynced { entries }))
            }
            Err(e) => {
                let failures = self.health.record_failure(&e);
                warn!(
                    "Full fetch of '{}' failed ({} consecutive): {}",
                    self.prefix, failures, e
                );
                self.needs_resync = true;
                Some(Err(e))
            }
        }
    }

    /// Sleeps for the current backoff delay. Returns `false` if cancelled.
    pub async fn back_off(&mut self) -> bool {
        let attempt = self.health.consecutive_failures().max(1);
        let delay = self.backoff.delay(attempt);
        debug!("Backing off {} ms before next KV read", delay.as_millis());
        cancellable(&mut self.shutdown, tokio::time::sleep(delay))
            .await
            .is_some()
    }

    fn absorb(&mut self, snapshot: KvSnapshot) {
        if snapshot.version < self.version {
            warn!(
                "KV version for '{}' went backwards ({} -> {}), forcing resync",
                self.prefix, self.version, snapshot.version
            );
            self.needs_resync = true;
            return;
        }

        self.health.record_success();
        self.version = snapshot.version;

        let current: BTreeMap<String, String> =
            self.relative_entries(snapshot).into_iter().collect();
        let events = diff(&self.known, &current);
        if !events.is_empty() {
            debug!(
                "Watch on '{}' observed {} change(s) at version {}",
                self.prefix,
                events.len(),
                self.version
            );
        }
        self.pending.extend(events);
        self.known = current;
    }

    fn relative_entries(&self, snapshot: KvSnapshot) -> Vec<(String, String)> {
        snapshot
            .entries
            .into_iter()
            .filter_map(|(key, value)| {
                relative_key(&self.prefix, &key).map(|path| (path.to_string(), value))
            })
            .collect()
    }
}

/// Classifies the difference between two trees, in path order.
fn diff(known: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for (path, value) in current {
        match known.get(path) {
            None => events.push(ChangeEvent::Added {
                path: path.clone(),
                value: value.clone(),
            }),
            Some(previous) if previous != value => events.push(ChangeEvent::Updated {
                path: path.clone(),
                value: value.clone(),
            }),
            Some(_) => {}
        }
    }

    for path in known.keys() {
        if !current.contains_key(path) {
            events.push(ChangeEvent::Removed { path: path.clone() });
        }
    }

    events.sort_by(|a, b| a.path().cmp(&b.path()));
    events
}

/// Runs `fut` unless shutdown is requested first (or the sender is gone).
async fn cancellable<F: Future>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => None,
        out = fut => Some(out),
    }
}
