// Rule store: owns the sync lifecycle and the published rule snapshot.
//
// Design Principles:
// 1. The published index is an immutable Arc swapped under a short write lock;
//    readers clone the Arc and never wait on the sync loop
// 2. Single writer: the sync loop and direct writes serialize on one mutex
//    before computing and publishing the next snapshot
// 3. Startup is strict: no Synced state without a successful full fetch
// 4. Stopping is total: stop_sync cancels a startup in progress and returns
//    only after the loop task has exited

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rule_engine::{ChangeEvent, Rule, RuleError, RuleIndex, RulePath};

use crate::health::HealthReport;
use crate::kv::{join_key, KvError, KvStore};
use crate::refresh::{run_sync_loop, SyncConfig, TreeWatcher, WatchHealth};

// ================================================================================================
// ERRORS AND STATE
// ================================================================================================

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Initial rule fetch failed after {attempts} attempt(s): {source}")]
    StartupFailed {
        attempts: u32,
        #[source]
        source: KvError,
    },

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("Invalid rule: {0}")]
    InvalidRule(#[from] RuleError),

    #[error("Rule store was stopped during startup")]
    Stopped,
}

/// Lifecycle state of a [`RuleStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Starting,
    Synced,
    Resyncing,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Stopped => "stopped",
            SyncState::Starting => "starting",
            SyncState::Synced => "synced",
            SyncState::Resyncing => "resyncing",
        }
    }
}

enum SyncHandle {
    /// Initial fetch in progress; no loop task yet
    Starting { shutdown: watch::Sender<bool> },
    Running {
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
}

// ================================================================================================
// RULE STORE
// ================================================================================================

/// Keeps an in-process [`RuleIndex`] in step with a KV prefix.
pub struct RuleStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    config: SyncConfig,
    /// Latest published snapshot
    snapshot: RwLock<Arc<RuleIndex>>,
    /// Serializes index mutation (sync loop and direct writes)
    writer: Mutex<()>,
    state: Mutex<SyncState>,
    health: Arc<WatchHealth>,
    ceiling_breaches: AtomicU64,
    running: tokio::sync::Mutex<Option<SyncHandle>>,
}

impl RuleStore {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, config: SyncConfig) -> Self {
        RuleStore {
            kv,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            config,
            snapshot: RwLock::new(Arc::new(RuleIndex::new())),
            writer: Mutex::new(()),
            state: Mutex::new(SyncState::Stopped),
            health: Arc::new(WatchHealth::new()),
            ceiling_breaches: AtomicU64::new(0),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn watch_health(&self) -> Arc<WatchHealth> {
        Arc::clone(&self.health)
    }

    /// Loads the full tree, then spawns the sync loop.
    ///
    /// Returns once the initial index is published. Fails with
    /// [`StoreError::StartupFailed`] (leaving the store `Stopped`) when the
    /// initial fetch keeps failing, or with [`StoreError::Stopped`] when
    /// [`RuleStore::stop_sync`] runs during startup. Calling it on a started
    /// store is a no-op.
    pub async fn start_sync(self: &Arc<Self>) -> Result<(), StoreError> {
        let shutdown_rx = {
            let mut running = self.running.lock().await;
            if running.is_some() {
                debug!("Sync on '{}' already started", self.prefix);
                return Ok(());
            }
            let (shutdown, shutdown_rx) = watch::channel(false);
            *running = Some(SyncHandle::Starting { shutdown });
            self.set_state(SyncState::Starting);
            shutdown_rx
        };
        info!("Starting rule sync on '{}'", self.prefix);

        let mut watcher = TreeWatcher::new(
            Arc::clone(&self.kv),
            self.prefix.clone(),
            self.config.clone(),
            Arc::clone(&self.health),
            shutdown_rx,
        );
        let fetched = self.initial_fetch(&mut watcher).await;

        // stop_sync signals under this lock, so a cancelled watcher means the
        // Starting handle has already been taken.
        let mut running = self.running.lock().await;
        if watcher.is_cancelled() {
            info!("Startup on '{}' abandoned by stop", self.prefix);
            return Err(StoreError::Stopped);
        }
        let shutdown = match running.take() {
            Some(SyncHandle::Starting { shutdown }) => shutdown,
            other => {
                *running = other;
                return Err(StoreError::Stopped);
            }
        };

        let initial = match fetched {
            Ok(event) => event,
            Err(e) => {
                self.set_state(SyncState::Stopped);
                return Err(e);
            }
        };

        self.apply(&initial);
        let index = self.current_index();
        info!(
            "Loaded {} rules from '{}' ({} global, {} principals)",
            index.len(),
            self.prefix,
            index.global_count(),
            index.principal_count()
        );

        self.set_state(SyncState::Synced);
        let task = tokio::spawn(run_sync_loop(Arc::clone(self), watcher));
        *running = Some(SyncHandle::Running { shutdown, task });
        Ok(())
    }

    async fn initial_fetch(&self, watcher: &mut TreeWatcher) -> Result<ChangeEvent, StoreError> {
        let attempts = self.config.startup_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match watcher.resync().await {
                Some(Ok(event)) => return Ok(event),
                Some(Err(e)) if attempt >= attempts => {
                    error!(
                        "Initial fetch of '{}' failed after {} attempt(s): {}",
                        self.prefix, attempt, e
                    );
                    return Err(StoreError::StartupFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
                Some(Err(_)) => {
                    if !watcher.back_off().await {
                        return Err(StoreError::Stopped);
                    }
                }
                None => return Err(StoreError::Stopped),
            }
        }
    }

    /// Stops the sync loop, or cancels a startup in progress, and waits for
    /// the loop to exit. Idempotent.
    ///
    /// The published index stays frozen at its last value.
    pub async fn stop_sync(&self) {
        let mut running = self.running.lock().await;
        match running.take() {
            None => {}
            Some(SyncHandle::Starting { shutdown }) => {
                let _ = shutdown.send(true);
                self.set_state(SyncState::Stopped);
                info!("Cancelled rule sync startup on '{}'", self.prefix);
            }
            Some(SyncHandle::Running { shutdown, task }) => {
                let _ = shutdown.send(true);
                if let Err(e) = task.await {
                    warn!("Sync task on '{}' ended abnormally: {}", self.prefix, e);
                }
                self.set_state(SyncState::Stopped);
                info!("Stopped rule sync on '{}'", self.prefix);
            }
        }
    }

    /// Latest published snapshot. Never blocks on I/O.
    pub fn current_index(&self) -> Arc<RuleIndex> {
        Arc::clone(&self.snapshot.read())
    }

    /// Applies one change event and publishes the resulting index.
    pub fn apply(&self, event: &ChangeEvent) {
        let _writer = self.writer.lock();
        let next = self.current_index().patch(event);
        debug!(
            "Applied {} {} -> generation {} ({} rules)",
            event.kind(),
            event.path().unwrap_or("*"),
            next.generation(),
            next.len()
        );
        *self.snapshot.write() = Arc::new(next);
    }

    /// Validates and writes a rule at `key` (`g/<id>` or `u/<principal>/<id>`).
    ///
    /// While syncing, the rule is applied to the local index immediately; the
    /// watcher's later observation of the same write replaces it.
    pub async fn add(&self, key: &str, value: &Value) -> Result<Arc<Rule>, StoreError> {
        let raw = value.to_string();
        let rule = Arc::new(Rule::from_entry(key, &raw)?);
        let path = RulePath::parse(key)?.to_path();

        self.kv.put(&join_key(&self.prefix, &path), &raw).await?;
        info!("Wrote rule {} ({})", path, rule.scope);

        self.apply_if_running(&ChangeEvent::Updated { path, value: raw })
            .await;
        Ok(rule)
    }

    /// Deletes the rule at `key`, dropping it from the local index while syncing.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = RulePath::parse(key)?.to_path();

        self.kv.delete(&join_key(&self.prefix, &path), false).await?;
        info!("Deleted rule {}", path);

        self.apply_if_running(&ChangeEvent::Removed { path }).await;
        Ok(())
    }

    /// Reads the tree once without starting the sync loop.
    pub async fn fetch_index(&self) -> Result<RuleIndex, StoreError> {
        let snapshot = self.kv.fetch(&self.prefix).await?;
        let entries: Vec<(String, String)> = snapshot
            .entries
            .into_iter()
            .filter_map(|(key, value)| {
                crate::kv::relative_key(&self.prefix, &key).map(|path| (path.to_string(), value))
            })
            .collect();
        Ok(RuleIndex::build(&entries))
    }

    /// Optimistic local apply. The guard is held across the patch so a
    /// concurrent stop_sync cannot complete in between.
    async fn apply_if_running(&self, event: &ChangeEvent) {
        let running = self.running.lock().await;
        if matches!(*running, Some(SyncHandle::Running { .. })) {
            self.apply(event);
        }
    }

    /// Current lifecycle state. A synced store whose reads are failing
    /// reports `Resyncing`.
    pub fn state(&self) -> SyncState {
        let state = *self.state.lock();
        if state == SyncState::Synced && self.health.consecutive_failures() > 0 {
            SyncState::Resyncing
        } else {
            state
        }
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        *self.state.lock() = state;
    }

    pub(crate) fn record_ceiling_breach(&self) -> u64 {
        self.ceiling_breaches.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot of sync health for readiness checks.
    pub fn health(&self) -> HealthReport {
        let index = self.current_index();
        let state = self.state();
        let last_sync_age = self
            .health
            .last_success()
            .map(|at| Instant::now().saturating_duration_since(at));
        let stale = match state {
            SyncState::Synced | SyncState::Resyncing => {
                last_sync_age.map_or(true, |age| age > self.config.staleness_ceiling)
            }
            SyncState::Stopped | SyncState::Starting => false,
        };

        HealthReport {
            state: state.as_str(),
            last_sync_age_ms: last_sync_age.map(|age| age.as_millis() as u64),
            consecutive_failures: self.health.consecutive_failures(),
            total_failures: self.health.total_failures(),
            ceiling_breaches: self.ceiling_breaches.load(Ordering::Relaxed),
            stale,
            global_rules: index.global_count(),
            principals: index.principal_count(),
            total_rules: index.len(),
            generation: index.generation(),
            diagnostics: index.diagnostics().clone(),
            last_error: self.health.last_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use rule_engine::ClaimSet;
    use serde_json::json;
    use std::time::Duration;

    const PREFIX: &str = "revocation-rules";

    fn fast_config() -> SyncConfig {
        SyncConfig {
            watch_timeout: Duration::from_millis(50),
            staleness_ceiling: Duration::from_millis(300),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            resync_after_failures: 3,
            startup_retries: 2,
        }
    }

    fn store(kv: &Arc<MemoryKv>) -> Arc<RuleStore> {
        let kv: Arc<dyn KvStore> = Arc::clone(kv) as Arc<dyn KvStore>;
        Arc::new(RuleStore::new(kv, PREFIX, fast_config()))
    }

    async fn seed(kv: &MemoryKv, path: &str, value: Value) {
        kv.put(&join_key(PREFIX, path), &value.to_string())
            .await
            .unwrap();
    }

    async fn wait_for(store: &RuleStore, what: &str, check: impl Fn(&RuleIndex) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if check(&store.current_index()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_start_loads_initial_index() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "g/1", json!({"iat": {"lte": 100}})).await;
        seed(&kv, "u/alice/1", json!({"rt": "r1"})).await;
        seed(&kv, "u/alice/2", json!("not an expression")).await;

        let store = store(&kv);
        assert_eq!(store.state(), SyncState::Stopped);
        store.start_sync().await.unwrap();

        let index = store.current_index();
        assert_eq!(store.state(), SyncState::Synced);
        assert_eq!(index.global_count(), 1);
        assert_eq!(index.user_rules("alice").len(), 1);
        assert_eq!(index.diagnostics().dropped_entries, 1);

        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_remote_changes_are_reflected() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);
        store.start_sync().await.unwrap();
        assert!(store.current_index().is_empty());

        seed(&kv, "u/alice/1", json!({"rt": "r1", "iat": {"lt": 100}})).await;
        wait_for(&store, "remote add", |idx| idx.get("u/alice/1").is_some()).await;

        let claims = ClaimSet::new().with("rt", "r1").with("iat", 50);
        let rule = store.current_index().get("u/alice/1").cloned().unwrap();
        assert!(rule.matches_at(&claims, chrono::Utc::now()));

        kv.delete(&join_key(PREFIX, "u/alice/1"), false)
            .await
            .unwrap();
        wait_for(&store, "remote delete", |idx| idx.is_empty()).await;

        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_stop_freezes_index() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "g/1", json!({"a": 1})).await;
        let store = store(&kv);
        store.start_sync().await.unwrap();

        store.stop_sync().await;
        store.stop_sync().await;
        assert_eq!(store.state(), SyncState::Stopped);

        let frozen = store.current_index();
        seed(&kv, "g/2", json!({"b": 2})).await;
        kv.delete(&join_key(PREFIX, "g/1"), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let after = store.current_index();
        assert!(Arc::ptr_eq(&frozen, &after));
        assert!(after.get("g/1").is_some());
        assert!(after.get("g/2").is_none());
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_poll() {
        let kv = Arc::new(MemoryKv::new());
        let mut config = fast_config();
        config.watch_timeout = Duration::from_secs(30);
        config.staleness_ceiling = Duration::from_secs(60);
        let store = Arc::new(RuleStore::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            PREFIX,
            config,
        ));
        store.start_sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), store.stop_sync())
            .await
            .expect("stop_sync waited out the long poll");
    }

    #[tokio::test]
    async fn test_startup_failure_leaves_store_stopped() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_available(false);
        let store = store(&kv);

        match store.start_sync().await {
            Err(StoreError::StartupFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected startup failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(store.state(), SyncState::Stopped);

        kv.set_available(true);
        store.start_sync().await.unwrap();
        assert_eq!(store.state(), SyncState::Synced);
        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_outage_is_visible_and_recovers() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "g/1", json!({"a": 1})).await;
        let store = store(&kv);
        store.start_sync().await.unwrap();

        kv.set_available(false);
        let deadline = Instant::now() + Duration::from_secs(3);
        while store.health().ceiling_breaches == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let report = store.health();
        assert!(report.ceiling_breaches >= 1);
        assert!(report.stale);
        assert!(!report.is_ready());
        assert_eq!(store.state(), SyncState::Resyncing);
        assert!(report.last_error.is_some());
        // Last good snapshot keeps serving.
        assert!(store.current_index().get("g/1").is_some());

        kv.set_available(true);
        seed(&kv, "g/2", json!({"b": 2})).await;
        wait_for(&store, "recovery", |idx| idx.get("g/2").is_some()).await;
        assert_eq!(store.state(), SyncState::Synced);
        assert!(store.health().is_ready());

        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_version_reset_triggers_resync() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "g/1", json!({"a": 1})).await;
        seed(&kv, "g/2", json!({"b": 2})).await;
        let store = store(&kv);
        store.start_sync().await.unwrap();
        let before = store.current_index().generation();

        kv.reset_version(1);
        wait_for(&store, "resync", |idx| idx.generation() > before).await;
        assert_eq!(store.current_index().len(), 2);

        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_add_applies_optimistically() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);
        store.start_sync().await.unwrap();

        let rule = store
            .add("u/alice/7", &json!({"rt": "r1"}))
            .await
            .unwrap();
        assert_eq!(rule.key, "u/alice/7");
        assert!(store.current_index().get("u/alice/7").is_some());
        assert_eq!(kv.len(), 1);

        store.remove("u/alice/7").await.unwrap();
        assert!(store.current_index().get("u/alice/7").is_none());
        assert!(kv.is_empty());

        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_input() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);

        assert!(matches!(
            store.add("x/1", &json!({"a": 1})).await,
            Err(StoreError::InvalidRule(_))
        ));
        assert!(matches!(
            store.add("g/1", &json!({"_or": "yes", "a": 1})).await,
            Err(StoreError::InvalidRule(_))
        ));
        assert!(kv.is_empty());

        // Not syncing: written remotely, local index untouched.
        store.add("g/1", &json!({"a": 1})).await.unwrap();
        assert_eq!(kv.len(), 1);
        assert!(store.current_index().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);
        store.start_sync().await.unwrap();
        store.stop_sync().await;

        seed(&kv, "g/1", json!({"a": 1})).await;
        store.start_sync().await.unwrap();
        assert!(store.current_index().get("g/1").is_some());

        seed(&kv, "g/2", json!({"a": 2})).await;
        wait_for(&store, "post-restart change", |idx| idx.len() == 2).await;
        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_stop_during_startup_cancels_promptly() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_available(false);
        let mut config = fast_config();
        config.startup_retries = 10;
        config.backoff_initial = Duration::from_millis(200);
        config.backoff_max = Duration::from_millis(200);
        let store = Arc::new(RuleStore::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            PREFIX,
            config,
        ));

        let starting = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.start_sync().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.state(), SyncState::Starting);

        tokio::time::timeout(Duration::from_millis(500), store.stop_sync())
            .await
            .expect("stop_sync waited for startup retries");
        let result = tokio::time::timeout(Duration::from_millis(500), starting)
            .await
            .expect("start_sync kept retrying after stop")
            .unwrap();
        assert!(matches!(result, Err(StoreError::Stopped)));
        assert_eq!(store.state(), SyncState::Stopped);

        kv.set_available(true);
        seed(&kv, "g/1", json!({"a": 1})).await;
        store.start_sync().await.unwrap();
        assert!(store.current_index().get("g/1").is_some());
        store.stop_sync().await;
    }

    #[tokio::test]
    async fn test_writes_after_stop_leave_index_frozen() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "g/1", json!({"a": 1})).await;
        let store = store(&kv);
        store.start_sync().await.unwrap();
        store.stop_sync().await;
        let frozen = store.current_index();

        store.add("g/2", &json!({"b": 2})).await.unwrap();
        store.remove("g/1").await.unwrap();

        assert!(Arc::ptr_eq(&frozen, &store.current_index()));
        assert_eq!(kv.len(), 1);
    }
}
