//! Request matching logic.
//!
//! A [`Matcher`] is a closed set of predicates over a [`Request`], evaluated
//! by a single dispatch in [`Matcher::matches`]. Matching never fails: a body
//! that is not JSON, a missing header or an unresolvable path is a non-match.

use crate::error::{Result, StubServerError};
use crate::request::Request;
use regex::Regex;
use serde_json::Value;

/// A predicate over an incoming request.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches every request (catch-all).
    Any,
    /// Method equality, ignoring case.
    MethodEquals(String),
    /// Exact path equality. Trailing slashes are significant.
    UriEquals(String),
    UriStartsWith(String),
    /// Full-match regex over the path.
    UriMatches(Regex),
    UriGlob(globset::GlobMatcher),
    /// Header name is case-insensitive, value is exact.
    HeaderEquals { name: String, value: String },
    /// Decoded query parameter equality.
    QueryEquals { name: String, value: String },
    /// Exact body text.
    TextBodyEquals(String),
    /// Structural equality of the JSON body.
    JsonBodyEquals(Value),
    /// A predicate on the values selected by a JSON path.
    JsonPath {
        path: JsonPathExpr,
        predicate: ValuePredicate,
    },
    /// All must match; evaluated left to right, stops at the first miss.
    And(Vec<Matcher>),
    /// Any must match; evaluated left to right, stops at the first hit.
    Or(Vec<Matcher>),
    Not(Box<Matcher>),
}

impl Matcher {
    pub fn method(method: impl Into<String>) -> Self {
        Self::MethodEquals(method.into())
    }

    pub fn uri(uri: impl Into<String>) -> Self {
        Self::UriEquals(uri.into())
    }

    pub fn uri_starts_with(prefix: impl Into<String>) -> Self {
        Self::UriStartsWith(prefix.into())
    }

    /// Path must fully match `pattern`.
    pub fn uri_matches(pattern: &str) -> Result<Self> {
        Ok(Self::UriMatches(full_match_regex(pattern)?))
    }

    pub fn uri_glob(pattern: &str) -> Result<Self> {
        let glob = globset::Glob::new(pattern)
            .map_err(|e| StubServerError::Configuration(format!("invalid glob: {e}")))?;
        Ok(Self::UriGlob(glob.compile_matcher()))
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HeaderEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn query(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::QueryEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::TextBodyEquals(body.into())
    }

    /// JSON body equal to the serialized form of `expected`.
    pub fn json<T: serde::Serialize>(expected: &T) -> Result<Self> {
        let value = serde_json::to_value(expected)
            .map_err(|e| StubServerError::Configuration(format!("invalid json: {e}")))?;
        Ok(Self::JsonBodyEquals(value))
    }

    /// Value at `path` equals `expected`.
    pub fn json_path_eq(path: &str, expected: impl Into<Value>) -> Self {
        Self::json_path(path, ValuePredicate::Equals(expected.into()))
    }

    pub fn json_path(path: &str, predicate: ValuePredicate) -> Self {
        Self::JsonPath {
            path: JsonPathExpr::new(path),
            predicate,
        }
    }

    pub fn and(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        Self::And(matchers.into_iter().collect())
    }

    pub fn or(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        Self::Or(matchers.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(matcher: Matcher) -> Self {
        Self::Not(Box::new(matcher))
    }

    /// Whether `request` satisfies this predicate.
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::MethodEquals(method) => request.method().eq_ignore_ascii_case(method),
            Matcher::UriEquals(uri) => request.uri() == uri,
            Matcher::UriStartsWith(prefix) => request.uri().starts_with(prefix.as_str()),
            Matcher::UriMatches(regex) => regex.is_match(request.uri()),
            Matcher::UriGlob(glob) => glob.is_match(request.uri()),
            Matcher::HeaderEquals { name, value } => request.header(name) == Some(value.as_str()),
            Matcher::QueryEquals { name, value } => {
                request.query_param(name).as_deref() == Some(value.as_str())
            }
            Matcher::TextBodyEquals(text) => request.body() == text.as_bytes(),
            Matcher::JsonBodyEquals(expected) => request
                .json()
                .map(|actual| json_eq(expected, actual))
                .unwrap_or(false),
            Matcher::JsonPath { path, predicate } => match request.json() {
                Some(json) => {
                    let selected = path.select(json);
                    match predicate {
                        ValuePredicate::Exists(expected) => selected.is_empty() != *expected,
                        _ => selected.iter().any(|v| predicate.test(v)),
                    }
                }
                None => false,
            },
            Matcher::And(matchers) => matchers.iter().all(|m| m.matches(request)),
            Matcher::Or(matchers) => matchers.iter().any(|m| m.matches(request)),
            Matcher::Not(matcher) => !matcher.matches(request),
        }
    }

    /// Validate anything that is only checked lazily (JSON paths).
    pub fn validate(&self) -> Result<()> {
        match self {
            Matcher::JsonPath { path, .. } => path.validate(),
            Matcher::And(matchers) | Matcher::Or(matchers) => {
                matchers.iter().try_for_each(Matcher::validate)
            }
            Matcher::Not(matcher) => matcher.validate(),
            _ => Ok(()),
        }
    }
}

/// A JSON path, normalized to its `$`-rooted form.
///
/// `cc_number`, `payment_info.cc_number` and `items[0]` are accepted as
/// shorthand for `$.cc_number` and so on. Recursive descent (`$..cc_number`)
/// is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPathExpr(String);

impl JsonPathExpr {
    pub fn new(path: &str) -> Self {
        let path = path.trim();
        let normalized = if path.starts_with('$') {
            path.to_string()
        } else if path.starts_with('[') {
            format!("${path}")
        } else {
            format!("$.{path}")
        };
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<()> {
        use jsonpath_rust::JsonPath;

        let parsed: std::result::Result<JsonPath, _> = JsonPath::try_from(self.0.as_str());
        parsed
            .map(|_| ())
            .map_err(|e| StubServerError::Configuration(format!("invalid json path {}: {e}", self.0)))
    }

    /// Every non-null value the path selects in `json`.
    pub fn select(&self, json: &Value) -> Vec<Value> {
        use jsonpath_rust::JsonPath;

        let path = match JsonPath::try_from(self.0.as_str()) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };

        match path.find(json) {
            Value::Array(values) => values.into_iter().filter(|v| !v.is_null()).collect(),
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

/// A test applied to a single value selected from a JSON body.
#[derive(Debug, Clone)]
pub enum ValuePredicate {
    Equals(Value),
    /// Full-match regex over the value's text.
    Matches(Regex),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    /// Evaluated against the whole selection: `Exists(false)` holds when
    /// the path selects nothing in a JSON body.
    Exists(bool),
    GreaterThan(f64),
    GreaterOrEqual(f64),
    LessThan(f64),
    LessOrEqual(f64),
}

impl ValuePredicate {
    pub fn matches(pattern: &str) -> Result<Self> {
        Ok(Self::Matches(full_match_regex(pattern)?))
    }

    fn test(&self, actual: &Value) -> bool {
        match self {
            ValuePredicate::Equals(expected) => json_eq(expected, actual),
            ValuePredicate::Matches(regex) => {
                scalar_text(actual).map(|s| regex.is_match(&s)).unwrap_or(false)
            }
            ValuePredicate::StartsWith(prefix) => scalar_text(actual)
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            ValuePredicate::EndsWith(suffix) => scalar_text(actual)
                .map(|s| s.ends_with(suffix.as_str()))
                .unwrap_or(false),
            ValuePredicate::Contains(needle) => scalar_text(actual)
                .map(|s| s.contains(needle.as_str()))
                .unwrap_or(false),
            ValuePredicate::Exists(expected) => *expected,
            ValuePredicate::GreaterThan(bound) => numeric(actual).is_some_and(|n| n > *bound),
            ValuePredicate::GreaterOrEqual(bound) => numeric(actual).is_some_and(|n| n >= *bound),
            ValuePredicate::LessThan(bound) => numeric(actual).is_some_and(|n| n < *bound),
            ValuePredicate::LessOrEqual(bound) => numeric(actual).is_some_and(|n| n <= *bound),
        }
    }
}

fn full_match_regex(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| StubServerError::Configuration(format!("invalid regex: {e}")))
}

/// Structural JSON equality where numbers compare by value and a string
/// expectation accepts a number with the same canonical text.
pub fn json_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => match (e.as_f64(), a.as_f64()) {
            (Some(e), Some(a)) => e == a,
            _ => e == a,
        },
        (Value::String(e), Value::String(a)) => e == a,
        (Value::String(e), Value::Number(a)) => *e == a.to_string(),
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(e, a)| json_eq(e, a))
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len()
                && e
                    .iter()
                    .all(|(key, e)| a.get(key).is_some_and(|a| json_eq(e, a)))
        }
        (e, a) => e == a,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
