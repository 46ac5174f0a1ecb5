//! Readiness report for the rule store.

use rule_engine::IndexDiagnostics;
use serde::Serialize;

/// Point-in-time view of sync health, serialisable for health endpoints.
///
/// The engine keeps serving the last good snapshot whatever this says;
/// callers decide whether a stale store should fail open or closed.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: &'static str,
    /// Milliseconds since the last successful KV read, if any
    pub last_sync_age_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    /// Times the staleness ceiling forced a resync
    pub ceiling_breaches: u64,
    /// Last successful read is older than the staleness ceiling
    pub stale: bool,
    pub global_rules: usize,
    pub principals: usize,
    pub total_rules: usize,
    pub generation: u64,
    pub diagnostics: IndexDiagnostics,
    pub last_error: Option<String>,
}

impl HealthReport {
    /// True when the store is synced and within its staleness ceiling.
    pub fn is_ready(&self) -> bool {
        self.state == "synced" && !self.stale
    }
}
