//! Decoded token claims handed to the evaluator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat mapping from claim name to value, as produced by the token verifier.
///
/// The engine only reads from it and never keeps it past one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimSet(Map<String, Value>);

impl ClaimSet {
    /// Creates an empty claim set.
    pub fn new() -> Self {
        ClaimSet(Map::new())
    }

    /// Builds a claim set from a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(ClaimSet(map)),
            _ => None,
        }
    }

    /// Returns the raw value of a claim.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Sets a claim, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`ClaimSet::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Resolves the principal identity from `claim`.
    ///
    /// Strings are used as-is; integer identities are rendered in decimal.
    pub fn principal(&self, claim: &str) -> Option<String> {
        match self.0.get(claim)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for ClaimSet {
    fn from(map: Map<String, Value>) -> Self {
        ClaimSet(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_requires_object() {
        assert!(ClaimSet::from_value(json!({"username": "alice"})).is_some());
        assert!(ClaimSet::from_value(json!(["username"])).is_none());
        assert!(ClaimSet::from_value(json!("alice")).is_none());
    }

    #[test]
    fn principal_accepts_strings_and_integers() {
        let claims = ClaimSet::new().with("username", "alice").with("uid", 777444777);
        assert_eq!(claims.principal("username").as_deref(), Some("alice"));
        assert_eq!(claims.principal("uid").as_deref(), Some("777444777"));
        assert_eq!(claims.principal("missing"), None);
    }

    #[test]
    fn principal_rejects_empty_and_non_scalar() {
        let claims = ClaimSet::new()
            .with("username", "")
            .with("aud", json!(["x", "y"]))
            .with("score", 1.5);
        assert_eq!(claims.principal("username"), None);
        assert_eq!(claims.principal("aud"), None);
        assert_eq!(claims.principal("score"), None);
    }
}
