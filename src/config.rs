//! Declarative rulesets.
//!
//! A ruleset is a top-level array of rule objects, in JSON or YAML:
//!
//! ```json
//! [
//!   { "request": { "method": "post", "uri": "/foo",
//!                  "json_path": { "path": "cc_number", "eq": "ABC123" } },
//!     "response": { "text": "bar" } },
//!   { "response": { "text": "foo" } }
//! ]
//! ```
//!
//! Rules are registered in document order; a rule without `request` matches
//! every request.

use crate::error::{Result, StubServerError};
use crate::matcher::{Matcher, ValuePredicate};
use crate::response::{Latency, ResponseTemplate};
use crate::rule::{Rule, RuleTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a ruleset comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Inline JSON or YAML text.
    Text(String),
    /// A file; `.yaml` and `.yml` are read as YAML, anything else as JSON.
    File(PathBuf),
    /// An already-parsed document.
    Value(Value),
}

impl ConfigSource {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

/// Turns rulesets into [`RuleTable`]s.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    base_dir: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that `response.file` paths are relative to.
    ///
    /// Defaults to the ruleset file's directory, or the working directory for
    /// inline sources.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn load(&self, source: ConfigSource) -> Result<RuleTable> {
        let (document, source_dir) = match source {
            ConfigSource::Text(text) => (parse_text(&text)?, None),
            ConfigSource::Value(value) => (value, None),
            ConfigSource::File(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| {
                    StubServerError::File {
                        path: path.clone(),
                        source,
                    }
                })?;
                let document = if is_yaml(&path) {
                    serde_yaml::from_str(&text).map_err(|e| {
                        StubServerError::Configuration(format!("invalid YAML: {e}"))
                    })?
                } else {
                    serde_json::from_str(&text).map_err(|e| {
                        StubServerError::Configuration(format!("invalid JSON: {e}"))
                    })?
                };
                (document, path.parent().map(Path::to_path_buf))
            }
        };

        let base_dir = self
            .base_dir
            .clone()
            .or(source_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        let entries = match document {
            Value::Array(entries) => entries,
            other => {
                return Err(StubServerError::Configuration(format!(
                    "expected an array of rules, found {}",
                    kind_of(&other)
                )))
            }
        };

        entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let definition: RuleDefinition = serde_json::from_value(entry).map_err(|e| {
                    StubServerError::InvalidRule {
                        index,
                        message: e.to_string(),
                    }
                })?;
                definition.compile(&base_dir).map_err(|e| e.at_rule(index))
            })
            .collect()
    }
}

fn parse_text(text: &str) -> Result<Value> {
    // JSON first; YAML is a superset but reports JSON mistakes poorly
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(json_err) => serde_yaml::from_str(text).map_err(|_| {
            StubServerError::Configuration(format!("invalid JSON: {json_err}"))
        }),
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One entry of a ruleset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    #[serde(default)]
    pub description: Option<String>,

    /// Request predicate; absent means "any request"
    #[serde(default)]
    pub request: Option<RequestDefinition>,

    pub response: ResponseDefinition,
}

impl RuleDefinition {
    pub fn compile(&self, base_dir: &Path) -> Result<Rule> {
        let matcher = match &self.request {
            Some(request) => request.compile()?,
            None => Matcher::Any,
        };
        matcher.validate()?;

        Ok(Rule {
            matcher,
            response: self.response.compile(base_dir)?,
            description: self.description.clone(),
        })
    }
}

/// Request predicate. Every present key must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDefinition {
    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub uri: Option<UriDefinition>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub queries: BTreeMap<String, String>,

    /// Exact body text
    #[serde(default)]
    pub text: Option<String>,

    /// Structurally equal JSON body
    #[serde(default)]
    pub json: Option<Value>,

    #[serde(default)]
    pub json_path: Option<JsonPathDefinitions>,

    #[serde(default)]
    pub and: Vec<RequestDefinition>,

    #[serde(default)]
    pub or: Vec<RequestDefinition>,

    #[serde(default)]
    pub not: Option<Box<RequestDefinition>>,
}

impl RequestDefinition {
    pub fn compile(&self) -> Result<Matcher> {
        let mut matchers = Vec::new();

        if let Some(method) = &self.method {
            matchers.push(Matcher::method(method.as_str()));
        }
        if let Some(uri) = &self.uri {
            matchers.push(uri.compile()?);
        }
        for (name, value) in &self.headers {
            matchers.push(Matcher::header(name.as_str(), value.as_str()));
        }
        for (name, value) in &self.queries {
            matchers.push(Matcher::query(name.as_str(), value.as_str()));
        }
        if let Some(text) = &self.text {
            matchers.push(Matcher::text(text.as_str()));
        }
        if let Some(json) = &self.json {
            matchers.push(Matcher::JsonBodyEquals(json.clone()));
        }
        if let Some(json_path) = &self.json_path {
            for definition in json_path.iter() {
                matchers.extend(definition.compile()?);
            }
        }
        if !self.and.is_empty() {
            let nested = self.and.iter().map(Self::compile).collect::<Result<Vec<_>>>()?;
            matchers.push(Matcher::And(nested));
        }
        if !self.or.is_empty() {
            let nested = self.or.iter().map(Self::compile).collect::<Result<Vec<_>>>()?;
            matchers.push(Matcher::Or(nested));
        }
        if let Some(not) = &self.not {
            matchers.push(Matcher::not(not.compile()?));
        }

        Ok(match matchers.len() {
            0 => Matcher::Any,
            1 => matchers.remove(0),
            _ => Matcher::And(matchers),
        })
    }
}

/// `"uri": "/foo"` or `"uri": { "match": "/foo/[0-9]+" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UriDefinition {
    Exact(String),
    Pattern(UriPattern),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UriPattern {
    Match(String),
    #[serde(alias = "startsWith")]
    StartsWith(String),
    Glob(String),
}

impl UriDefinition {
    fn compile(&self) -> Result<Matcher> {
        match self {
            UriDefinition::Exact(uri) => Ok(Matcher::uri(uri.as_str())),
            UriDefinition::Pattern(UriPattern::Match(pattern)) => Matcher::uri_matches(pattern),
            UriDefinition::Pattern(UriPattern::StartsWith(prefix)) => {
                Ok(Matcher::uri_starts_with(prefix.as_str()))
            }
            UriDefinition::Pattern(UriPattern::Glob(pattern)) => Matcher::uri_glob(pattern),
        }
    }
}

/// A single `json_path` object or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonPathDefinitions {
    One(JsonPathDefinition),
    Many(Vec<JsonPathDefinition>),
}

impl JsonPathDefinitions {
    pub fn iter(&self) -> impl Iterator<Item = &JsonPathDefinition> {
        match self {
            JsonPathDefinitions::One(one) => std::slice::from_ref(one).iter(),
            JsonPathDefinitions::Many(many) => many.iter(),
        }
    }
}

/// A JSON path and the operators its value must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonPathDefinition {
    pub path: String,

    #[serde(default)]
    pub eq: Option<Value>,

    /// Full-match regex
    #[serde(default, rename = "match")]
    pub matches: Option<String>,

    #[serde(default, alias = "startsWith")]
    pub starts_with: Option<String>,

    #[serde(default, alias = "endsWith")]
    pub ends_with: Option<String>,

    #[serde(default)]
    pub contain: Option<String>,

    #[serde(default)]
    pub exist: Option<bool>,

    #[serde(default)]
    pub gt: Option<f64>,

    #[serde(default)]
    pub gte: Option<f64>,

    #[serde(default)]
    pub lt: Option<f64>,

    #[serde(default)]
    pub lte: Option<f64>,
}

impl JsonPathDefinition {
    /// One matcher per operator present.
    pub fn compile(&self) -> Result<Vec<Matcher>> {
        let mut predicates = Vec::new();

        if let Some(eq) = &self.eq {
            predicates.push(ValuePredicate::Equals(eq.clone()));
        }
        if let Some(pattern) = &self.matches {
            predicates.push(ValuePredicate::matches(pattern)?);
        }
        if let Some(prefix) = &self.starts_with {
            predicates.push(ValuePredicate::StartsWith(prefix.clone()));
        }
        if let Some(suffix) = &self.ends_with {
            predicates.push(ValuePredicate::EndsWith(suffix.clone()));
        }
        if let Some(needle) = &self.contain {
            predicates.push(ValuePredicate::Contains(needle.clone()));
        }
        if let Some(exist) = self.exist {
            predicates.push(ValuePredicate::Exists(exist));
        }
        if let Some(bound) = self.gt {
            predicates.push(ValuePredicate::GreaterThan(bound));
        }
        if let Some(bound) = self.gte {
            predicates.push(ValuePredicate::GreaterOrEqual(bound));
        }
        if let Some(bound) = self.lt {
            predicates.push(ValuePredicate::LessThan(bound));
        }
        if let Some(bound) = self.lte {
            predicates.push(ValuePredicate::LessOrEqual(bound));
        }

        if predicates.is_empty() {
            return Err(StubServerError::Configuration(format!(
                "json_path {} has no operator",
                self.path
            )));
        }

        Ok(predicates
            .into_iter()
            .map(|predicate| Matcher::json_path(&self.path, predicate))
            .collect())
    }
}

/// Response half of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub latency: Option<LatencyDefinition>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub json: Option<Value>,

    /// Relative to the loader's base directory
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub base64: Option<String>,

    /// Handlebars source rendered per request
    #[serde(default)]
    pub template: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    pub fn compile(&self, base_dir: &Path) -> Result<ResponseTemplate> {
        let sources = [
            self.text.is_some(),
            self.json.is_some(),
            self.file.is_some(),
            self.base64.is_some(),
            self.template.is_some(),
        ];
        if sources.iter().filter(|present| **present).count() > 1 {
            return Err(StubServerError::Configuration(
                "response has more than one body source".to_string(),
            ));
        }

        let mut template = if let Some(text) = &self.text {
            ResponseTemplate::text(text.as_str())
        } else if let Some(json) = &self.json {
            ResponseTemplate::json(json.clone())
        } else if let Some(file) = &self.file {
            ResponseTemplate::file(base_dir.join(file))?
        } else if let Some(encoded) = &self.base64 {
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| StubServerError::Configuration(format!("invalid base64: {e}")))?;
            ResponseTemplate::bytes(decoded)
        } else if let Some(source) = &self.template {
            ResponseTemplate::template(source.as_str())?
        } else {
            ResponseTemplate::empty()
        };

        template.status = self.status;
        template.headers = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        template.latency = self.latency.as_ref().map(LatencyDefinition::to_latency);
        template.validate()?;

        Ok(template)
    }
}

/// Latency simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatencyDefinition {
    /// Fixed delay in milliseconds; wins over the range
    #[serde(default)]
    pub fixed_ms: u64,

    #[serde(default)]
    pub min_ms: u64,

    #[serde(default)]
    pub max_ms: u64,
}

impl LatencyDefinition {
    pub fn to_latency(&self) -> Latency {
        if self.fixed_ms > 0 {
            Latency::fixed(Duration::from_millis(self.fixed_ms))
        } else {
            Latency::between(
                Duration::from_millis(self.min_ms),
                Duration::from_millis(self.max_ms.max(self.min_ms)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::response::BodySource;
    use crate::template::TemplateEngine;
    use serde_json::json;

    fn load(text: &str) -> Result<RuleTable> {
        ConfigLoader::new().load(ConfigSource::text(text))
    }

    fn respond(table: &RuleTable, request: &Request) -> Option<String> {
        let rule = table.find(request)?;
        let response = rule.response.render(request, &TemplateEngine::new()).ok()?;
        Some(String::from_utf8_lossy(&response.body).into_owned())
    }

    fn demo(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
    }

    #[test]
    fn test_catch_all_ruleset() {
        let table = load(r#"[{ "response": { "text": "bar" } }]"#).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(respond(&table, &Request::new("POST", "/")).as_deref(), Some("bar"));
        assert_eq!(respond(&table, &Request::new("GET", "/x")).as_deref(), Some("bar"));
    }

    #[test]
    fn test_method_uri_and_json_path() {
        let table = load(
            r#"[{ "request": { "method": "post", "uri": "/foo",
                               "json_path": {"path": "cc_number", "eq": "ABC123"} },
                  "response": { "text": "bar" } }]"#,
        )
        .unwrap();

        let hit = Request::new("POST", "/foo").with_json(&json!({"amount": 10, "cc_number": "ABC123"}));
        assert_eq!(respond(&table, &hit).as_deref(), Some("bar"));

        let wrong_method = Request::new("GET", "/foo").with_json(&json!({"cc_number": "ABC123"}));
        assert!(table.find(&wrong_method).is_none());
    }

    #[test]
    fn test_order_is_preserved() {
        let table = load(
            r#"[
                { "request": { "uri": "/a" }, "response": { "text": "first" } },
                { "response": { "text": "catch-all" } },
                { "request": { "uri": "/b" }, "response": { "text": "unreachable" } }
            ]"#,
        )
        .unwrap();
        assert_eq!(respond(&table, &Request::new("GET", "/a")).as_deref(), Some("first"));
        assert_eq!(respond(&table, &Request::new("GET", "/b")).as_deref(), Some("catch-all"));
    }

    #[test]
    fn test_value_source() {
        let table = ConfigLoader::new()
            .load(ConfigSource::Value(json!([
                { "request": { "headers": { "X-Token": "t1" }, "queries": { "page": "2" } },
                  "response": { "status": 202, "json": { "ok": true } } }
            ])))
            .unwrap();

        let request = Request::new("GET", "/?page=2").with_header("x-token", "t1");
        let rule = table.find(&request).unwrap();
        assert_eq!(rule.response.status, 202);
        assert!(matches!(rule.response.body, BodySource::Json { .. }));
    }

    #[test]
    fn test_uri_patterns() {
        let table = load(
            r#"[
                { "request": { "uri": { "match": "/users/[0-9]+" } }, "response": { "text": "user" } },
                { "request": { "uri": { "startsWith": "/static/" } }, "response": { "text": "asset" } },
                { "request": { "uri": { "glob": "/docs/**" } }, "response": { "text": "doc" } }
            ]"#,
        )
        .unwrap();
        assert_eq!(respond(&table, &Request::new("GET", "/users/12")).as_deref(), Some("user"));
        assert_eq!(respond(&table, &Request::new("GET", "/static/app.js")).as_deref(), Some("asset"));
        assert_eq!(respond(&table, &Request::new("GET", "/docs/a/b")).as_deref(), Some("doc"));
        assert!(table.find(&Request::new("GET", "/users/x")).is_none());
    }

    #[test]
    fn test_and_or_not() {
        let table = load(
            r#"[{ "request": {
                    "or": [ { "method": "get" }, { "method": "head" } ],
                    "not": { "uri": "/private" }
                  },
                  "response": { "text": "public" } }]"#,
        )
        .unwrap();
        assert!(table.find(&Request::new("GET", "/")).is_some());
        assert!(table.find(&Request::new("HEAD", "/")).is_some());
        assert!(table.find(&Request::new("POST", "/")).is_none());
        assert!(table.find(&Request::new("GET", "/private")).is_none());
    }

    #[test]
    fn test_unknown_key_reports_index() {
        let err = load(
            r#"[
                { "response": { "text": "ok" } },
                { "request": { "methd": "get" }, "response": { "text": "typo" } }
            ]"#,
        )
        .unwrap_err();
        match err {
            StubServerError::InvalidRule { index, message } => {
                assert_eq!(index, 1);
                assert!(message.contains("methd"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_response_is_error() {
        let err = load(r#"[{ "request": { "uri": "/" } }]"#).unwrap_err();
        assert!(matches!(err, StubServerError::InvalidRule { index: 0, .. }));
    }

    #[test]
    fn test_malformed_syntax() {
        let err = load(r#"[{ "response": "#).unwrap_err();
        assert!(matches!(err, StubServerError::Configuration(_)));

        let err = load(r#"{ "response": { "text": "bar" } }"#).unwrap_err();
        assert!(err.to_string().contains("expected an array"));
    }

    #[test]
    fn test_invalid_rule_parts_report_index() {
        let cases = [
            r#"[{ "request": { "uri": { "match": "(" } }, "response": {} }]"#,
            r#"[{ "request": { "json_path": { "path": "amount" } }, "response": {} }]"#,
            r#"[{ "response": { "status": 99 } }]"#,
            r#"[{ "response": { "text": "a", "json": {} } }]"#,
            r#"[{ "response": { "template": "{{#if x}}" } }]"#,
            r#"[{ "response": { "base64": "***" } }]"#,
        ];
        for case in cases {
            let err = load(case).unwrap_err();
            assert!(
                matches!(err, StubServerError::InvalidRule { index: 0, .. }),
                "{case}: {err}"
            );
        }
    }

    #[test]
    fn test_file_response_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("body.txt"), "from file").unwrap();

        let table = ConfigLoader::new()
            .with_base_dir(dir.path())
            .load(ConfigSource::text(r#"[{ "response": { "file": "body.txt" } }]"#))
            .unwrap();
        assert_eq!(respond(&table, &Request::new("GET", "/")).as_deref(), Some("from file"));
    }

    #[test]
    fn test_missing_file_refuses_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_base_dir(dir.path())
            .load(ConfigSource::text(
                r#"[{ "response": { "text": "ok" } }, { "response": { "file": "missing.txt" } }]"#,
            ))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, StubServerError::InvalidRule { index: 1, .. }));
    }

    #[test]
    fn test_missing_ruleset_file() {
        let err = ConfigLoader::new()
            .load(ConfigSource::file("/no/such/rules.json"))
            .unwrap_err();
        assert!(matches!(err, StubServerError::File { .. }));
    }

    #[test]
    fn test_bar_fixture() {
        let table = ConfigLoader::new().load(ConfigSource::file(demo("bar.json"))).unwrap();
        assert_eq!(respond(&table, &Request::new("GET", "/")).as_deref(), Some("bar"));
    }

    #[test]
    fn test_cc_fixture() {
        let table = ConfigLoader::new().load(ConfigSource::file(demo("cc.json"))).unwrap();
        let pay = |body: Value| respond(&table, &Request::new("POST", "/").with_json(&body));

        assert_eq!(
            pay(json!({"amount": 11, "cc_number": "4111111111111111"})).as_deref(),
            Some("success")
        );
        assert_eq!(
            pay(json!({"amount": 9, "cc_number": "4444444444444448"})).as_deref(),
            Some("processor failure")
        );
        assert_eq!(
            pay(json!({"amount": 8, "cc_number": "4222222222222220"})).as_deref(),
            Some("invalid card")
        );
        assert_eq!(
            pay(json!({
                "amount": 10,
                "payment_info": {"cc_number": "4111111111111111", "CVV2": "123", "expiration": "09/24"}
            }))
            .as_deref(),
            Some("success")
        );
        assert_eq!(pay(json!({"amount": 10})), None);
    }

    #[test]
    fn test_yaml_fixture_matches_json() {
        let table = ConfigLoader::new().load(ConfigSource::file(demo("cc.yaml"))).unwrap();
        assert_eq!(table.len(), 3);
        let request = Request::new("POST", "/").with_json(&json!({"amount": 9, "cc_number": "4111111111111111"}));
        assert_eq!(respond(&table, &request).as_deref(), Some("processor failure"));
    }

    #[test]
    fn test_latency_definition() {
        let fixed = LatencyDefinition { fixed_ms: 100, min_ms: 5, max_ms: 10 };
        assert_eq!(fixed.to_latency(), Latency::fixed(Duration::from_millis(100)));

        let range = LatencyDefinition { fixed_ms: 0, min_ms: 50, max_ms: 150 };
        let delay = range.to_latency().sample();
        assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
    }
}
