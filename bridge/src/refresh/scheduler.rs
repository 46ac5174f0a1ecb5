//! Sync loop - background task that keeps the published rule index current.
//!
//! Consumes [`TreeWatcher`] events and applies them to the store. A staleness
//! ceiling bounds how long the loop may go without a successful KV read; when
//! it is exceeded the loop forces a full resync through the same code path the
//! watcher uses for version gaps.

use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use rule_engine::ChangeEvent;

use super::watcher::{TreeWatcher, WatchHealth};
use crate::store::{RuleStore, SyncState};

/// Timing and retry settings for the sync loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum wait of a single blocking KV read
    pub watch_timeout: Duration,
    /// Longest allowed gap between successful reads before a forced resync
    pub staleness_ceiling: Duration,
    /// First retry delay after a transport error
    pub backoff_initial: Duration,
    /// Upper bound on the retry delay
    pub backoff_max: Duration,
    /// Consecutive failures after which the watcher stops diffing and refetches
    pub resync_after_failures: u32,
    /// Extra attempts for the initial fetch before startup fails
    pub startup_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch_timeout: Duration::from_millis(5_000),
            staleness_ceiling: Duration::from_millis(7_000),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(5_000),
            resync_after_failures: 5,
            startup_retries: 5,
        }
    }
}

/// Result of waiting for the next event under the staleness ceiling.
enum Wait {
    Event(ChangeEvent),
    Stale,
    Cancelled,
}

/// Runs until the watcher is cancelled.
///
/// Spawned by [`RuleStore::start_sync`] after the initial fetch succeeded.
pub async fn run_sync_loop(store: Arc<RuleStore>, mut watcher: TreeWatcher) {
    let ceiling = store.sync_config().staleness_ceiling;
    let health = store.watch_health();
    let mut anchor = Instant::now();

    info!(
        "Sync loop running on '{}' with {} ms staleness ceiling",
        store.prefix(),
        ceiling.as_millis()
    );

    loop {
        match within_ceiling(&health, ceiling, anchor, watcher.next()).await {
            Wait::Event(event) => {
                store.set_state(SyncState::Synced);
                store.apply(&event);
            }
            Wait::Cancelled => break,
            Wait::Stale => {
                let breaches = store.record_ceiling_breach();
                warn!(
                    "No successful KV read on '{}' within {} ms (breach #{}), forcing resync",
                    store.prefix(),
                    ceiling.as_millis(),
                    breaches
                );
                anchor = Instant::now();
                store.set_state(SyncState::Resyncing);

                match watcher.resync().await {
                    Some(Ok(event)) => {
                        store.set_state(SyncState::Synced);
                        store.apply(&event);
                    }
                    Some(Err(_)) => {
                        if !watcher.back_off().await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!("Sync loop on '{}' stopped", store.prefix());
}

/// Drives `next` until it yields or the last successful read (or `anchor`,
/// whichever is later) is older than `ceiling`.
///
/// The deadline is re-evaluated whenever it passes, so a watcher that keeps
/// completing idle long polls is never interrupted.
async fn within_ceiling<F>(health: &WatchHealth, ceiling: Duration, anchor: Instant, next: F) -> Wait
where
    F: Future<Output = Option<ChangeEvent>>,
{
    tokio::pin!(next);
    loop {
        let fresh_since = health
            .last_success()
            .map_or(anchor, |last| last.max(anchor));
        let deadline = fresh_since + ceiling;
        if deadline <= Instant::now() {
            return Wait::Stale;
        }

        tokio::select! {
            event = &mut next => {
                return match event {
                    Some(event) => Wait::Event(event),
                    None => Wait::Cancelled,
                };
            }
            _ = sleep_until(deadline) => {}
        }
    }
}
