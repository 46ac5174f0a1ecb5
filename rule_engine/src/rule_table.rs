// Immutable rule index with copy-on-write patching.
//
// Design Principles:
// 1. Snapshots are immutable: readers hold an Arc and never see a partial update
// 2. `patch` is pure: it returns a new index and leaves its input untouched
// 3. Rules are shared between generations via Arc, so a patch copies pointers,
//    not expressions
// 4. Malformed entries are dropped and counted, never fatal
//
// Layout:
// - global:  rules under g/<ruleId>, in insertion order
// - by_user: principal -> rules under u/<principal>/<ruleId>, in insertion order

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::event::ChangeEvent;
use crate::rule_metadata::{Rule, RulePath, RuleScope};

// ============================================================================
// Diagnostics
// ============================================================================

/// Counters surfaced through health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexDiagnostics {
    /// Entries dropped since the last full build (bad path or bad value).
    pub dropped_entries: usize,
    /// Unknown operator keys across all live rules.
    pub unknown_operators: usize,
}

// ============================================================================
// Rule Index
// ============================================================================

/// Point-in-time view of every loaded rule, grouped by scope.
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    global: Vec<Arc<Rule>>,
    by_user: HashMap<String, Vec<Arc<Rule>>>,
    generation: u64,
    diagnostics: IndexDiagnostics,
}

impl RuleIndex {
    /// Creates an empty index (generation 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from raw `(path, json)` entries.
    ///
    /// Later entries for the same path replace earlier ones.
    pub fn build(entries: &[(String, String)]) -> Self {
        let mut index = RuleIndex::new();
        for (path, raw) in entries {
            index.upsert_entry(path, raw);
        }
        index.generation = 1;
        index
    }

    /// Applies one change event and returns the resulting index.
    pub fn patch(&self, event: &ChangeEvent) -> Self {
        if let ChangeEvent::Resynced { entries } = event {
            let mut rebuilt = RuleIndex::build(entries);
            rebuilt.generation = self.generation + 1;
            return rebuilt;
        }

        let mut next = self.clone();
        next.generation += 1;

        match event {
            ChangeEvent::Added { path, value } | ChangeEvent::Updated { path, value } => {
                next.upsert_entry(path, value);
            }
            ChangeEvent::Removed { path } => {
                next.remove_path(path);
            }
            ChangeEvent::Resynced { .. } => {}
        }

        next
    }

    // ========================================================================
    // Mutation helpers (private: only used while building a new generation)
    // ========================================================================

    fn upsert_entry(&mut self, path: &str, raw: &str) {
        match Rule::from_entry(path, raw) {
            Ok(rule) => self.upsert(Arc::new(rule)),
            Err(e) => {
                warn!("Dropping revocation rule at '{}': {}", path, e);
                self.diagnostics.dropped_entries += 1;
                // The KV tree no longer holds a usable rule at this path.
                self.remove_path(path);
            }
        }
    }

    fn upsert(&mut self, rule: Arc<Rule>) {
        self.diagnostics.unknown_operators += rule.expression.unknown_operators();

        let list = match &rule.scope {
            RuleScope::Global => &mut self.global,
            RuleScope::User(principal) => self.by_user.entry(principal.clone()).or_default(),
        };

        match list.iter().position(|existing| existing.key == rule.key) {
            Some(pos) => {
                let old = std::mem::replace(&mut list[pos], rule);
                self.diagnostics.unknown_operators -= old.expression.unknown_operators();
            }
            None => list.push(rule),
        }
    }

    fn remove_path(&mut self, path: &str) -> Option<Arc<Rule>> {
        let rule_path = RulePath::parse(path).ok()?;

        let removed = match &rule_path.scope {
            RuleScope::Global => take_by_key(&mut self.global, path),
            RuleScope::User(principal) => {
                let list = self.by_user.get_mut(principal)?;
                let removed = take_by_key(list, path);
                if list.is_empty() {
                    self.by_user.remove(principal);
                }
                removed
            }
        }?;

        self.diagnostics.unknown_operators -= removed.expression.unknown_operators();
        Some(removed)
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    /// Rules that apply to every principal.
    pub fn global_rules(&self) -> &[Arc<Rule>] {
        &self.global
    }

    /// Rules scoped to `principal` (empty if none).
    pub fn user_rules(&self, principal: &str) -> &[Arc<Rule>] {
        self.by_user
            .get(principal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Looks a rule up by its prefix-relative path.
    pub fn get(&self, path: &str) -> Option<&Arc<Rule>> {
        let rule_path = RulePath::parse(path).ok()?;
        let list = match &rule_path.scope {
            RuleScope::Global => self.global.as_slice(),
            RuleScope::User(principal) => self.user_rules(principal),
        };
        list.iter().find(|rule| rule.key == path)
    }

    /// All rules: global first, then users ordered by principal.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let mut principals: Vec<&String> = self.by_user.keys().collect();
        principals.sort();

        let mut out: Vec<Arc<Rule>> = self.global.iter().cloned().collect();
        for principal in principals {
            out.extend(self.by_user[principal].iter().cloned());
        }
        out
    }

    /// Total number of rules.
    pub fn len(&self) -> usize {
        self.global.len() + self.by_user.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_count(&self) -> usize {
        self.global.len()
    }

    /// Number of principals with at least one rule.
    pub fn principal_count(&self) -> usize {
        self.by_user.len()
    }

    /// Incremented on every build or patch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn diagnostics(&self) -> &IndexDiagnostics {
        &self.diagnostics
    }
}

fn take_by_key(list: &mut Vec<Arc<Rule>>, key: &str) -> Option<Arc<Rule>> {
    let pos = list.iter().position(|rule| rule.key == key)?;
    Some(list.remove(pos))
}
