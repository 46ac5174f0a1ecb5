// This module implements the matching half of a revocation rule: a predicate
// over the claims of an already verified token. Rules arrive as loosely shaped
// JSON from the KV tree and are parsed once, at load time, into a small tagged
// AST. Evaluation then never inspects JSON shapes again.
//
// Expression grammar (JSON):
//   { "<claim>": <literal>,                    implicit equality
//     "<claim>": { "<op>": <operand>, ... },   operator object, ops AND-ed
//     "<claim>": { "<op>": ..., "_or": true }, operator object, ops OR-ed
//     "_or": true,                             OR the per-claim results
//     "ttl": <epoch millis | RFC 3339> }       rule is inert once expired
//
// Known operators: eq, gt, lt, gte, lte, match (substring), sw (prefix).

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::claims::ClaimSet;
use crate::error::RuleError;

/// Control key switching a combinator from AND to OR.
pub const OR_KEY: &str = "_or";

/// Control key carrying the expiry instant of an expression.
pub const TTL_KEY: &str = "ttl";

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

/// Comparison operators accepted inside an operator object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Equal,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,   // "match": claim contains operand
    StartsWith, // "sw": claim starts with operand
    /// Operator key outside the known set. Never matches.
    Unknown(String),
}

impl ComparisonOp {
    /// Maps an operator key from the rule JSON.
    pub fn from_key(key: &str) -> Self {
        match key {
            "eq" => ComparisonOp::Equal,
            "gt" => ComparisonOp::GreaterThan,
            "lt" => ComparisonOp::LessThan,
            "gte" => ComparisonOp::GreaterThanOrEqual,
            "lte" => ComparisonOp::LessThanOrEqual,
            "match" => ComparisonOp::Contains,
            "sw" => ComparisonOp::StartsWith,
            other => ComparisonOp::Unknown(other.to_string()),
        }
    }

    /// Returns the operator key as written in rule JSON.
    pub fn key(&self) -> &str {
        match self {
            ComparisonOp::Equal => "eq",
            ComparisonOp::GreaterThan => "gt",
            ComparisonOp::LessThan => "lt",
            ComparisonOp::GreaterThanOrEqual => "gte",
            ComparisonOp::LessThanOrEqual => "lte",
            ComparisonOp::Contains => "match",
            ComparisonOp::StartsWith => "sw",
            ComparisonOp::Unknown(key) => key,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ComparisonOp::Unknown(_))
    }
}

/// A single operator applied to a claim value.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub op: ComparisonOp,
    pub operand: Value,
}

impl Comparison {
    pub fn new(op: ComparisonOp, operand: Value) -> Self {
        Comparison { op, operand }
    }

    /// Applies the operator to `claim`. Type mismatches fail closed.
    pub fn evaluate(&self, claim: &Value) -> bool {
        match self.op {
            ComparisonOp::Equal => values_equal(claim, &self.operand),
            ComparisonOp::GreaterThan => compare_numbers(claim, &self.operand, |a, b| a > b),
            ComparisonOp::LessThan => compare_numbers(claim, &self.operand, |a, b| a < b),
            ComparisonOp::GreaterThanOrEqual => {
                compare_numbers(claim, &self.operand, |a, b| a >= b)
            }
            ComparisonOp::LessThanOrEqual => compare_numbers(claim, &self.operand, |a, b| a <= b),
            ComparisonOp::Contains => match (claim, &self.operand) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                _ => false,
            },
            ComparisonOp::StartsWith => match (claim, &self.operand) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            ComparisonOp::Unknown(_) => false,
        }
    }
}

/// Type-aware equality: numbers compare by value (`10 == 10.0`), everything
/// else must agree on type and content.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return a == b;
            }
            if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                return a == b;
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

fn compare_numbers(claim: &Value, operand: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (claim.as_f64(), operand.as_f64()) {
        (Some(a), Some(b)) if claim.is_number() && operand.is_number() => cmp(a, b),
        _ => false,
    }
}

// ============================================================================
// CLAUSES
// ============================================================================

/// The parsed form of one claim's condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Bare value: implicit equality.
    Literal(Value),

    /// Operator object with exactly one operator.
    Operator(Comparison),

    /// Operator object with zero or several operators.
    /// `any` selects OR (set by a local `_or: true`) instead of AND.
    Group { comparisons: Vec<Comparison>, any: bool },
}

impl Clause {
    /// Parses the JSON condition attached to a claim name.
    pub fn parse(value: &Value) -> Result<Clause, RuleError> {
        let object = match value {
            Value::Object(object) => object,
            literal => return Ok(Clause::Literal(literal.clone())),
        };

        let any = parse_or_flag(object)?;
        let mut comparisons: Vec<Comparison> = object
            .iter()
            .filter(|(key, _)| key.as_str() != OR_KEY)
            .map(|(key, operand)| Comparison::new(ComparisonOp::from_key(key), operand.clone()))
            .collect();

        if comparisons.len() == 1 {
            return Ok(Clause::Operator(comparisons.remove(0)));
        }

        Ok(Clause::Group { comparisons, any })
    }

    /// Evaluates the clause against a present claim value.
    pub fn evaluate(&self, claim: &Value) -> bool {
        match self {
            Clause::Literal(expected) => values_equal(claim, expected),
            Clause::Operator(comparison) => comparison.evaluate(claim),
            Clause::Group { comparisons, any } => {
                if comparisons.is_empty() {
                    return false;
                }
                if *any {
                    comparisons.iter().any(|c| c.evaluate(claim))
                } else {
                    comparisons.iter().all(|c| c.evaluate(claim))
                }
            }
        }
    }

    /// Number of operator keys in this clause outside the known set.
    pub fn unknown_operators(&self) -> usize {
        match self {
            Clause::Literal(_) => 0,
            Clause::Operator(comparison) => usize::from(!comparison.op.is_known()),
            Clause::Group { comparisons, .. } => {
                comparisons.iter().filter(|c| !c.op.is_known()).count()
            }
        }
    }
}

/// A clause bound to the claim it inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimClause {
    pub claim: String,
    pub clause: Clause,
}

// ============================================================================
// RULE EXPRESSION
// ============================================================================

/// Immutable, parsed revocation predicate.
///
/// An expression with no clauses never matches, and neither does one whose
/// `ttl` has passed.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleExpression {
    clauses: Vec<ClaimClause>,
    any: bool,
    ttl: Option<DateTime<Utc>>,
}

impl RuleExpression {
    /// Parses an expression from raw KV text.
    pub fn from_json_str(raw: &str) -> Result<Self, RuleError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::parse(&value)
    }

    /// Parses an expression from JSON.
    ///
    /// Accepts an object, or a string whose content is a JSON object
    /// (double-encoded values written by string-oriented tooling).
    pub fn parse(value: &Value) -> Result<Self, RuleError> {
        match value {
            Value::Object(object) => Self::parse_object(object),
            Value::String(inner) => match serde_json::from_str::<Value>(inner) {
                Ok(Value::Object(object)) => Self::parse_object(&object),
                _ => Err(RuleError::NotAnObject(describe(value))),
            },
            other => Err(RuleError::NotAnObject(describe(other))),
        }
    }

    fn parse_object(object: &Map<String, Value>) -> Result<Self, RuleError> {
        let any = parse_or_flag(object)?;
        let ttl = match object.get(TTL_KEY) {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_ttl(value)?),
        };

        let mut clauses = Vec::with_capacity(object.len());
        for (claim, condition) in object {
            if claim == OR_KEY || claim == TTL_KEY {
                continue;
            }
            clauses.push(ClaimClause {
                claim: claim.clone(),
                clause: Clause::parse(condition)?,
            });
        }

        Ok(RuleExpression { clauses, any, ttl })
    }

    /// Evaluates against the wall clock.
    pub fn matches(&self, claims: &ClaimSet) -> bool {
        self.matches_at(claims, Utc::now())
    }

    /// Evaluates as of `now`. Pure: same inputs, same answer.
    pub fn matches_at(&self, claims: &ClaimSet, now: DateTime<Utc>) -> bool {
        if self.clauses.is_empty() || self.is_expired_at(now) {
            return false;
        }

        let check = |cc: &ClaimClause| match claims.get(&cc.claim) {
            Some(value) => cc.clause.evaluate(value),
            None => false,
        };

        if self.any {
            self.clauses.iter().any(check)
        } else {
            self.clauses.iter().all(check)
        }
    }

    /// True once the TTL has strictly passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.ttl, Some(ttl) if now > ttl)
    }

    pub fn clauses(&self) -> &[ClaimClause] {
        &self.clauses
    }

    /// True when per-claim results are OR-ed.
    pub fn is_any(&self) -> bool {
        self.any
    }

    pub fn ttl(&self) -> Option<DateTime<Utc>> {
        self.ttl
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Total unknown operator keys across all clauses.
    pub fn unknown_operators(&self) -> usize {
        self.clauses
            .iter()
            .map(|cc| cc.clause.unknown_operators())
            .sum()
    }
}

fn parse_or_flag(object: &Map<String, Value>) -> Result<bool, RuleError> {
    match object.get(OR_KEY) {
        None => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(RuleError::InvalidControl {
            key: OR_KEY.to_string(),
            reason: format!("expected boolean, got {}", describe(other)),
        }),
    }
}

/// Numbers are milliseconds since the Unix epoch; strings are RFC 3339.
fn parse_ttl(value: &Value) -> Result<DateTime<Utc>, RuleError> {
    match value {
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| RuleError::InvalidTtl(n.to_string()))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| RuleError::InvalidTtl(n.to_string()))
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RuleError::InvalidTtl(format!("{}: {}", s, e))),
        other => Err(RuleError::InvalidTtl(describe(other))),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expr(value: Value) -> RuleExpression {
        RuleExpression::parse(&value).unwrap()
    }

    fn claims(value: Value) -> ClaimSet {
        ClaimSet::from_value(value).unwrap()
    }

    #[test]
    fn gt_is_strict() {
        let e = expr(json!({"gtVal": {"gt": 10}}));
        assert!(e.matches(&claims(json!({"gtVal": 11}))));
        assert!(!e.matches(&claims(json!({"gtVal": 10}))));
        assert!(!e.matches(&claims(json!({"gtVal": 9}))));
    }

    #[test]
    fn lte_includes_bound() {
        let e = expr(json!({"lteVal": {"lte": 10}}));
        assert!(e.matches(&claims(json!({"lteVal": 9}))));
        assert!(e.matches(&claims(json!({"lteVal": 10}))));
        assert!(!e.matches(&claims(json!({"lteVal": 11}))));
    }

    #[test]
    fn lt_and_gte() {
        let lt = expr(json!({"v": {"lt": 5}}));
        assert!(lt.matches(&claims(json!({"v": 4.5}))));
        assert!(!lt.matches(&claims(json!({"v": 5}))));

        let gte = expr(json!({"v": {"gte": 5}}));
        assert!(gte.matches(&claims(json!({"v": 5.0}))));
        assert!(!gte.matches(&claims(json!({"v": 4}))));
    }

    #[test]
    fn sw_is_prefix_only() {
        let e = expr(json!({"swVal": {"sw": "some"}}));
        assert!(e.matches(&claims(json!({"swVal": "someThatStarts"}))));
        assert!(!e.matches(&claims(json!({"swVal": "xsomeThatNotStarts"}))));
    }

    #[test]
    fn match_is_substring() {
        let e = expr(json!({"aud": {"match": "api"}}));
        assert!(e.matches(&claims(json!({"aud": "public.api.v1"}))));
        assert!(!e.matches(&claims(json!({"aud": "web"}))));
        assert!(!e.matches(&claims(json!({"aud": 42}))));
    }

    #[test]
    fn ordering_fails_closed_on_non_numbers() {
        let e = expr(json!({"iat": {"gt": 10}}));
        assert!(!e.matches(&claims(json!({"iat": "11"}))));

        let e = expr(json!({"iat": {"gt": "10"}}));
        assert!(!e.matches(&claims(json!({"iat": 11}))));
    }

    #[test]
    fn literal_equality_is_type_aware() {
        let e = expr(json!({"cs": 5}));
        assert!(e.matches(&claims(json!({"cs": 5}))));
        assert!(e.matches(&claims(json!({"cs": 5.0}))));
        assert!(!e.matches(&claims(json!({"cs": "5"}))));

        let e = expr(json!({"rt": "r1"}));
        assert!(e.matches(&claims(json!({"rt": "r1"}))));
        assert!(!e.matches(&claims(json!({"rt": "r2"}))));
    }

    #[test]
    fn explicit_eq_operator() {
        let e = expr(json!({"st": {"eq": 1}}));
        assert!(e.matches(&claims(json!({"st": 1}))));
        assert!(!e.matches(&claims(json!({"st": 2}))));
    }

    #[test]
    fn top_level_or_vs_and() {
        let any = expr(json!({"_or": true, "a": {"sw": "x"}, "b": "y"}));
        assert!(any.matches(&claims(json!({"a": "xa", "b": "n"}))));
        assert!(any.matches(&claims(json!({"a": "na", "b": "y"}))));
        assert!(!any.matches(&claims(json!({"a": "na", "b": "n"}))));

        let all = expr(json!({"a": {"sw": "x"}, "b": "y"}));
        assert!(all.matches(&claims(json!({"a": "xa", "b": "y"}))));
        assert!(!all.matches(&claims(json!({"a": "xa", "b": "n"}))));
        assert!(!all.matches(&claims(json!({"a": "na", "b": "y"}))));
    }

    #[test]
    fn multi_operator_clause_and_or() {
        let range = expr(json!({"iat": {"gt": 1, "lt": 10}}));
        assert!(range.matches(&claims(json!({"iat": 5}))));
        assert!(!range.matches(&claims(json!({"iat": 10}))));

        let either = expr(json!({"iat": {"lt": 1, "gt": 10, "_or": true}}));
        assert!(either.matches(&claims(json!({"iat": 0}))));
        assert!(either.matches(&claims(json!({"iat": 11}))));
        assert!(!either.matches(&claims(json!({"iat": 5}))));
    }

    #[test]
    fn absent_claim_fails_clause() {
        let e = expr(json!({"rt": "r1", "iat": {"lt": 100}}));
        assert!(!e.matches(&claims(json!({"iat": 50}))));

        let any = expr(json!({"_or": true, "rt": "r1", "cs": "r1"}));
        assert!(any.matches(&claims(json!({"cs": "r1"}))));
    }

    #[test]
    fn empty_expression_never_matches() {
        let e = expr(json!({}));
        assert!(e.is_empty());
        assert!(!e.matches(&claims(json!({"username": "alice"}))));

        let only_controls = expr(json!({"_or": true, "ttl": null}));
        assert!(!only_controls.matches(&claims(json!({}))));
    }

    #[test]
    fn unknown_operator_fails_only_its_clause() {
        let e = expr(json!({"_or": true, "a": {"regex": ".*"}, "b": "y"}));
        assert_eq!(e.unknown_operators(), 1);
        assert!(!e.matches(&claims(json!({"a": "anything"}))));
        assert!(e.matches(&claims(json!({"a": "anything", "b": "y"}))));
    }

    #[test]
    fn empty_operator_object_never_matches() {
        let e = expr(json!({"a": {}}));
        assert!(!e.matches(&claims(json!({"a": {}}))));
    }

    #[test]
    fn ttl_expires_rule() {
        let e = expr(json!({"username": "alice", "ttl": 1_000}));
        let c = claims(json!({"username": "alice"}));
        let before = Utc.timestamp_millis_opt(999).unwrap();
        let at = Utc.timestamp_millis_opt(1_000).unwrap();
        let after = Utc.timestamp_millis_opt(1_001).unwrap();
        assert!(e.matches_at(&c, before));
        assert!(e.matches_at(&c, at));
        assert!(!e.matches_at(&c, after));
    }

    #[test]
    fn ttl_accepts_rfc3339() {
        let e = expr(json!({"username": "alice", "ttl": "2030-01-01T00:00:00Z"}));
        let ttl = e.ttl().unwrap();
        assert_eq!(ttl.timestamp(), 1_893_456_000);
    }

    #[test]
    fn invalid_controls_are_rejected() {
        assert!(matches!(
            RuleExpression::parse(&json!({"_or": "yes", "a": 1})),
            Err(RuleError::InvalidControl { .. })
        ));
        assert!(matches!(
            RuleExpression::parse(&json!({"a": 1, "ttl": [1]})),
            Err(RuleError::InvalidTtl(_))
        ));
        assert!(matches!(
            RuleExpression::parse(&json!({"a": {"gt": 1, "_or": 1}})),
            Err(RuleError::InvalidControl { .. })
        ));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(matches!(
            RuleExpression::parse(&json!([1, 2])),
            Err(RuleError::NotAnObject(_))
        ));
        assert!(matches!(
            RuleExpression::from_json_str("{not json"),
            Err(RuleError::InvalidJson(_))
        ));
    }

    #[test]
    fn double_encoded_object_is_accepted() {
        let e = expr(json!("{\"rt\":\"r1\"}"));
        assert!(e.matches(&claims(json!({"rt": "r1"}))));
        assert!(RuleExpression::parse(&json!("r1")).is_err());
    }

    #[test]
    fn evaluation_is_repeatable() {
        let e = expr(json!({"_or": true, "iat": {"lte": 100}, "username": "bob"}));
        let c = claims(json!({"username": "alice", "iat": 100}));
        let now = Utc::now();
        let first = e.matches_at(&c, now);
        for _ in 0..10 {
            assert_eq!(e.matches_at(&c, now), first);
        }
        assert!(first);
    }

    #[test]
    fn array_literals_compare_element_wise() {
        let e = expr(json!({"audience": ["x", "y"]}));
        assert!(e.matches(&claims(json!({"audience": ["x", "y"]}))));
        assert!(!e.matches(&claims(json!({"audience": ["y", "x"]}))));
        assert!(!e.matches(&claims(json!({"audience": "x"}))));
    }
}
