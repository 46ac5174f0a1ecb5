//! # Revocation Engine
//!
//! Decides whether a decoded claim set has been revoked:
//! 1. Reads the store's current snapshot (no I/O, no waiting on sync)
//! 2. Resolves the principal from the identity claim
//! 3. Checks the principal's own rules, then the global rules
//! 4. The first matching rule blacklists the token

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rule_engine::{ClaimSet, Rule, RuleIndex};

use crate::health::HealthReport;
use crate::store::RuleStore;

/// Claim used to pick per-principal rules when none is configured.
pub const DEFAULT_IDENTITY_CLAIM: &str = "username";

// ============================================================================
// Verdict
// ============================================================================

/// Outcome of one evaluation. Never cached.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub blacklisted: bool,
    pub matched_rule: Option<Arc<Rule>>,
}

impl Verdict {
    fn allowed() -> Self {
        Verdict {
            blacklisted: false,
            matched_rule: None,
        }
    }

    fn revoked(rule: &Arc<Rule>) -> Self {
        Verdict {
            blacklisted: true,
            matched_rule: Some(Arc::clone(rule)),
        }
    }

    /// Machine-readable reason: `ok` or `blacklisted`.
    pub fn reason_code(&self) -> &'static str {
        if self.blacklisted {
            "blacklisted"
        } else {
            "ok"
        }
    }
}

/// Evaluation counters.
#[derive(Debug, Default)]
pub struct EvaluationStats {
    evaluations: AtomicU64,
    blacklisted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub evaluations: u64,
    pub blacklisted: u64,
}

impl EvaluationStats {
    fn record(&self, verdict: &Verdict) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        if verdict.blacklisted {
            self.blacklisted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            blacklisted: self.blacklisted.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Public evaluation API over a [`RuleStore`].
pub struct RevocationEngine {
    store: Arc<RuleStore>,
    identity_claim: String,
    stats: EvaluationStats,
}

impl RevocationEngine {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self::with_identity_claim(store, DEFAULT_IDENTITY_CLAIM)
    }

    pub fn with_identity_claim(store: Arc<RuleStore>, identity_claim: impl Into<String>) -> Self {
        RevocationEngine {
            store,
            identity_claim: identity_claim.into(),
            stats: EvaluationStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn identity_claim(&self) -> &str {
        &self.identity_claim
    }

    /// Evaluates `claims` against the latest published rules.
    pub fn evaluate(&self, claims: &ClaimSet) -> Verdict {
        self.evaluate_at(claims, Utc::now())
    }

    /// Same as [`RevocationEngine::evaluate`] with an explicit clock.
    pub fn evaluate_at(&self, claims: &ClaimSet, now: DateTime<Utc>) -> Verdict {
        let index = self.store.current_index();
        let verdict = evaluate_index(&index, claims, &self.identity_claim, now);
        self.stats.record(&verdict);

        if let Some(rule) = &verdict.matched_rule {
            debug!(
                "Token for {} blacklisted by rule {}",
                claims
                    .principal(&self.identity_claim)
                    .as_deref()
                    .unwrap_or("<anonymous>"),
                rule.key
            );
        }
        verdict
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        self.store.health()
    }
}

/// Evaluates `claims` against one snapshot.
///
/// Per-principal rules are checked first; both lists form a single union, so
/// the order only affects which matching rule is reported.
pub fn evaluate_index(
    index: &RuleIndex,
    claims: &ClaimSet,
    identity_claim: &str,
    now: DateTime<Utc>,
) -> Verdict {
    if let Some(principal) = claims.principal(identity_claim) {
        if let Some(rule) = index
            .user_rules(&principal)
            .iter()
            .find(|rule| rule.matches_at(claims, now))
        {
            return Verdict::revoked(rule);
        }
    }

    index
        .global_rules()
        .iter()
        .find(|rule| rule.matches_at(claims, now))
        .map(Verdict::revoked)
        .unwrap_or_else(Verdict::allowed)
}
