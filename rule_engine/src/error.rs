//! Error types for rule parsing and indexing.

use thiserror::Error;

/// Errors raised while turning a raw KV entry into a [`Rule`](crate::Rule).
///
/// None of these are fatal to the index: a failing entry is logged,
/// counted and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Invalid rule path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Rule expression must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("Invalid control key '{key}': {reason}")]
    InvalidControl { key: String, reason: String },

    #[error("Invalid ttl: {0}")]
    InvalidTtl(String),
}

impl RuleError {
    pub(crate) fn path(path: &str, reason: impl Into<String>) -> Self {
        RuleError::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::InvalidJson(err.to_string())
    }
}
