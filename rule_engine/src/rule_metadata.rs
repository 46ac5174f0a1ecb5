// Identity and scope of a revocation rule.
//
// Rules live in the KV tree under one of two path shapes (relative to the
// watched prefix):
//
//   g/<ruleId>               applies to every principal
//   u/<principal>/<ruleId>   applies only to tokens of <principal>
//
// The path is the rule's identity: a later write to the same path replaces
// the rule, a delete removes it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::error::RuleError;
use crate::match_clause::RuleExpression;

const GLOBAL_SEGMENT: &str = "g";
const USER_SEGMENT: &str = "u";

/// Which tokens a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "principal", rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    User(String),
}

impl RuleScope {
    pub fn is_global(&self) -> bool {
        matches!(self, RuleScope::Global)
    }

    /// Returns the principal for user-scoped rules.
    pub fn principal(&self) -> Option<&str> {
        match self {
            RuleScope::Global => None,
            RuleScope::User(principal) => Some(principal),
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Global => write!(f, "global"),
            RuleScope::User(principal) => write!(f, "user:{}", principal),
        }
    }
}

/// A rule path split into scope and rule id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RulePath {
    pub scope: RuleScope,
    pub rule_id: String,
}

impl RulePath {
    /// Parses a prefix-relative path such as `g/7` or `u/alice/3`.
    pub fn parse(path: &str) -> Result<Self, RuleError> {
        let segments: Vec<&str> = path.split('/').collect();
        match segments.as_slice() {
            [GLOBAL_SEGMENT, rule_id] => Ok(RulePath {
                scope: RuleScope::Global,
                rule_id: non_empty(path, "rule id", rule_id)?,
            }),
            [USER_SEGMENT, principal, rule_id] => Ok(RulePath {
                scope: RuleScope::User(non_empty(path, "principal", principal)?),
                rule_id: non_empty(path, "rule id", rule_id)?,
            }),
            [GLOBAL_SEGMENT, ..] => Err(RuleError::path(path, "expected g/<ruleId>")),
            [USER_SEGMENT, ..] => Err(RuleError::path(path, "expected u/<principal>/<ruleId>")),
            _ => Err(RuleError::path(path, "unknown scope segment")),
        }
    }

    /// Renders the canonical prefix-relative path.
    pub fn to_path(&self) -> String {
        match &self.scope {
            RuleScope::Global => format!("{}/{}", GLOBAL_SEGMENT, self.rule_id),
            RuleScope::User(principal) => {
                format!("{}/{}/{}", USER_SEGMENT, principal, self.rule_id)
            }
        }
    }

    pub fn global(rule_id: impl Into<String>) -> Self {
        RulePath {
            scope: RuleScope::Global,
            rule_id: rule_id.into(),
        }
    }

    pub fn user(principal: impl Into<String>, rule_id: impl Into<String>) -> Self {
        RulePath {
            scope: RuleScope::User(principal.into()),
            rule_id: rule_id.into(),
        }
    }
}

fn non_empty(path: &str, what: &str, segment: &str) -> Result<String, RuleError> {
    if segment.is_empty() {
        Err(RuleError::path(path, format!("empty {}", what)))
    } else {
        Ok(segment.to_string())
    }
}

/// A loaded revocation rule. Never mutated after construction.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub scope: RuleScope,
    /// Prefix-relative KV path, e.g. `u/alice/1`.
    pub key: String,
    /// JSON the expression was parsed from.
    pub source: Value,
    #[serde(skip)]
    pub expression: RuleExpression,
    pub inserted_at: DateTime<Utc>,
}

impl Rule {
    /// Parses a raw KV entry into a rule.
    pub fn from_entry(path: &str, raw: &str) -> Result<Self, RuleError> {
        let rule_path = RulePath::parse(path)?;
        let source: Value = serde_json::from_str(raw)?;
        let expression = RuleExpression::parse(&source)?;
        Ok(Rule {
            scope: rule_path.scope,
            key: path.to_string(),
            source,
            expression,
            inserted_at: Utc::now(),
        })
    }

    /// Evaluates this rule's expression as of `now`.
    pub fn matches_at(&self, claims: &crate::ClaimSet, now: DateTime<Utc>) -> bool {
        self.expression.matches_at(claims, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_global_and_user_paths() {
        assert_eq!(RulePath::parse("g/7").unwrap(), RulePath::global("7"));
        assert_eq!(
            RulePath::parse("u/alice/3").unwrap(),
            RulePath::user("alice", "3")
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "g", "g/", "g/1/2", "u/alice", "u//1", "u/alice/", "x/1", "u/a/b/c"] {
            assert!(
                matches!(RulePath::parse(path), Err(RuleError::InvalidPath { .. })),
                "path {:?} should be rejected",
                path
            );
        }
    }

    #[test]
    fn path_round_trips_through_to_path() {
        for path in ["g/1", "u/777444777/r-12"] {
            assert_eq!(RulePath::parse(path).unwrap().to_path(), path);
        }
    }

    #[test]
    fn rule_from_entry_keeps_source() {
        let rule = Rule::from_entry("u/alice/1", r#"{"rt":"r1","iat":{"lt":100}}"#).unwrap();
        assert_eq!(rule.scope, RuleScope::User("alice".to_string()));
        assert_eq!(rule.key, "u/alice/1");
        assert_eq!(rule.source, json!({"rt": "r1", "iat": {"lt": 100}}));
        assert_eq!(rule.expression.clauses().len(), 2);
    }

    #[test]
    fn rule_from_entry_reports_bad_json() {
        assert!(matches!(
            Rule::from_entry("g/1", "{"),
            Err(RuleError::InvalidJson(_))
        ));
        assert!(matches!(
            Rule::from_entry("g/1", "42"),
            Err(RuleError::NotAnObject(_))
        ));
    }

    #[test]
    fn scope_serializes_with_principal() {
        let value = serde_json::to_value(RuleScope::User("bob".into())).unwrap();
        assert_eq!(value, json!({"type": "user", "principal": "bob"}));
        let value = serde_json::to_value(RuleScope::Global).unwrap();
        assert_eq!(value, json!({"type": "global"}));
    }
}
