//! JSON rule expressions for segment membership.
//!
//! An expression is an object with a single operator key:
//!
//! ```json
//! {"all": [
//!     {"eq": ["user.traits.tier", "vip"]},
//!     {"in": ["ctx.country", ["US", "CA"]]},
//!     {"not": {"exists": "user.traits.churned"}}
//! ]}
//! ```
//!
//! Paths are dot separated and resolved against the context bundle
//! `{user: {id, traits}, ctx: {...}, request: {namespace, surface, k, blend?}}`.
//! A path that does not resolve makes the comparison false.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("rule node must be an object")]
    NotObject,
    #[error("{op} expects {expected}")]
    Shape { op: String, expected: &'static str },
    #[error("unsupported operator {0:?}")]
    UnknownOperator(String),
    #[error("unsupported comparison target")]
    UnsupportedTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl ComparisonOperator {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Equals => ord == Ordering::Equal,
            Self::GreaterThan => ord == Ordering::Greater,
            Self::GreaterThanOrEqual => ord != Ordering::Less,
            Self::LessThan => ord == Ordering::Less,
            Self::LessThanOrEqual => ord != Ordering::Greater,
        }
    }
}

/// Evaluates expressions against one context bundle.
pub struct Evaluator<'a> {
    data: &'a Value,
    now: DateTime<Utc>,
}

impl<'a> Evaluator<'a> {
    pub fn new(data: &'a Value, now: DateTime<Utc>) -> Self {
        Self { data, now }
    }

    /// Evaluate `expr`. Multiple operator keys in one object must all hold.
    pub fn matches(&self, expr: &Value) -> Result<bool, ExprError> {
        let obj = expr.as_object().ok_or(ExprError::NotObject)?;
        if obj.is_empty() {
            return Ok(false);
        }
        for (op, arg) in obj {
            if !self.apply(op, arg)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, op: &str, arg: &Value) -> Result<bool, ExprError> {
        match op.to_ascii_lowercase().as_str() {
            "any" | "or" => {
                for child in children(op, arg)? {
                    if self.matches(child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "all" | "and" => {
                for child in children(op, arg)? {
                    if !self.matches(child)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            "not" => Ok(!self.matches(arg)?),
            "eq" => self.compare(op, ComparisonOperator::Equals, arg),
            "neq" | "ne" => Ok(!self.compare(op, ComparisonOperator::Equals, arg)?),
            "gt" => self.compare(op, ComparisonOperator::GreaterThan, arg),
            "gte" => self.compare(op, ComparisonOperator::GreaterThanOrEqual, arg),
            "lt" => self.compare(op, ComparisonOperator::LessThan, arg),
            "lte" => self.compare(op, ComparisonOperator::LessThanOrEqual, arg),
            "in" => {
                let (path, values) = pair(op, arg)?;
                let set = values.as_array().ok_or_else(|| shape(op, "[path, array]"))?;
                Ok(self
                    .resolve(path)
                    .is_some_and(|actual| set.iter().any(|v| loose_eq(actual, v))))
            }
            "contains" => {
                let (path, needle) = pair(op, arg)?;
                Ok(match self.resolve(path) {
                    Some(Value::String(hay)) => as_text(needle)
                        .is_some_and(|n| hay.to_lowercase().contains(&n.to_lowercase())),
                    Some(Value::Array(items)) => items.iter().any(|v| loose_eq(v, needle)),
                    _ => false,
                })
            }
            "exists" => {
                let path = arg.as_str().ok_or_else(|| shape(op, "a string path"))?;
                Ok(self.resolve(path).is_some())
            }
            "gte_days_since" => {
                let (path, days) = pair(op, arg)?;
                let days = as_number(days).ok_or_else(|| shape(op, "[path, days]"))?;
                let ts = self
                    .resolve(path)
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
                Ok(ts.is_some_and(|ts| {
                    let elapsed = self.now.signed_duration_since(ts.with_timezone(&Utc));
                    elapsed.num_seconds() as f64 >= days * 86_400.0
                }))
            }
            other => Err(ExprError::UnknownOperator(other.to_string())),
        }
    }

    fn compare(&self, op: &str, cmp: ComparisonOperator, arg: &Value) -> Result<bool, ExprError> {
        let (path, target) = pair(op, arg)?;
        let Some(actual) = self.resolve(path) else {
            return Ok(false);
        };
        let ord = match target {
            Value::Number(n) => {
                let (Some(a), Some(t)) = (as_number(actual), n.as_f64()) else {
                    return Ok(false);
                };
                a.partial_cmp(&t)
            }
            Value::String(t) => as_text(actual).map(|a| a.as_str().cmp(t.as_str())),
            Value::Bool(t) => {
                if cmp != ComparisonOperator::Equals {
                    return Ok(false);
                }
                as_bool(actual).map(|a| a.cmp(t))
            }
            _ => return Err(ExprError::UnsupportedTarget),
        };
        Ok(ord.is_some_and(|o| cmp.holds(o)))
    }

    fn resolve(&self, path: &str) -> Option<&'a Value> {
        path.split('.').try_fold(self.data, |node, part| node.as_object()?.get(part))
    }
}

fn shape(op: &str, expected: &'static str) -> ExprError {
    ExprError::Shape {
        op: op.to_string(),
        expected,
    }
}

fn children<'v>(op: &str, arg: &'v Value) -> Result<&'v Vec<Value>, ExprError> {
    arg.as_array().ok_or_else(|| shape(op, "an array"))
}

fn pair<'v>(op: &str, arg: &'v Value) -> Result<(&'v str, &'v Value), ExprError> {
    match arg.as_array().map(Vec::as_slice) {
        Some([Value::String(path), value]) => Ok((path.as_str(), value)),
        _ => Err(shape(op, "[path, value]")),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Membership equality: numbers by value, strings case-insensitively.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match a {
        Value::Number(_) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        Value::String(s) => as_text(b).is_some_and(|t| s.eq_ignore_ascii_case(&t)),
        Value::Bool(x) => as_bool(b) == Some(*x),
        Value::Null => b.is_null(),
        _ => a == b,
    }
}
