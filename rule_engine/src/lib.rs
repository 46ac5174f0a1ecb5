//! # Revocation Rule Engine
//!
//! Claim-based token revocation rules: parsing rule JSON into expressions,
//! evaluating them against decoded token claims, and keeping an immutable,
//! patchable index of all rules grouped by scope.
//!
//! This crate is pure and synchronous; synchronisation with the KV store
//! lives in the `bridge` crate.

pub mod claims;
pub mod error;
pub mod event;
pub mod match_clause;
pub mod rule_metadata;
pub mod rule_table;

pub use claims::ClaimSet;
pub use error::RuleError;
pub use event::ChangeEvent;
pub use match_clause::{ClaimClause, Clause, Comparison, ComparisonOp, RuleExpression};
pub use rule_metadata::{Rule, RulePath, RuleScope};
pub use rule_table::{IndexDiagnostics, RuleIndex};
