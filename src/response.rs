//! Response templates and rendering.
//!
//! Static body sources (text, JSON, files, binary) are resolved when the
//! template is built, so rendering a static response never touches the disk.
//! Only handlebars templates are evaluated per request.

use crate::error::{Result, StubServerError};
use crate::request::Request;
use crate::template::TemplateEngine;
use bytes::Bytes;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a response body comes from.
#[derive(Debug, Clone)]
pub enum BodySource {
    Empty,
    Text(Bytes),
    /// JSON value with its serialized form.
    Json { value: Value, encoded: Bytes },
    /// Raw bytes (e.g. decoded from base64 configuration).
    Bytes(Bytes),
    /// File content read when the template was built.
    File { path: PathBuf, content: Bytes },
    /// Handlebars source, rendered against each request.
    Template(String),
}

impl BodySource {
    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            BodySource::Empty => None,
            BodySource::Text(_) | BodySource::Template(_) => Some("text/plain; charset=utf-8"),
            BodySource::Json { .. } => Some("application/json"),
            BodySource::Bytes(_) => Some("application/octet-stream"),
            BodySource::File { path, .. } => Some(content_type_for(path)),
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

/// Simulated response latency: fixed, or uniform over a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    min: Duration,
    max: Duration,
}

impl Latency {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
        }
    }

    /// Uniform between `min` and `max`; the bounds are swapped if reversed.
    pub fn between(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Pick the delay for one response.
    pub fn sample(&self) -> Duration {
        if self.max > self.min {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            rng.gen_range(self.min..=self.max)
        } else {
            self.min
        }
    }
}

/// Everything needed to produce a response.
#[derive(Debug, Clone)]
pub struct ResponseTemplate {
    pub status: u16,
    /// Explicit headers; they override the defaults set by rendering.
    pub headers: Vec<(String, String)>,
    pub body: BodySource,
    pub latency: Option<Latency>,
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: BodySource::Empty,
            latency: None,
        }
    }
}

impl ResponseTemplate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::with_body(BodySource::Text(Bytes::from(text.into())))
    }

    /// Serialize `value` once; every response reuses the encoded bytes.
    pub fn json(value: Value) -> Self {
        let encoded = Bytes::from(value.to_string());
        Self::with_body(BodySource::Json { value, encoded })
    }

    pub fn bytes(content: impl Into<Bytes>) -> Self {
        Self::with_body(BodySource::Bytes(content.into()))
    }

    /// Read `path` now. Fails if the file cannot be read.
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read(&path).map_err(|source| StubServerError::File {
            path: path.clone(),
            source,
        })?;
        Ok(Self::with_body(BodySource::File {
            path,
            content: Bytes::from(content),
        }))
    }

    /// A handlebars body. The template is compiled once to reject bad syntax.
    pub fn template(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        TemplateEngine::validate(&source)?;
        Ok(Self::with_body(BodySource::Template(source)))
    }

    fn with_body(body: BodySource) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Check status and headers can be put on the wire.
    pub fn validate(&self) -> Result<()> {
        // hyper cannot send an informational status as a final response
        if !(200..=599).contains(&self.status) {
            return Err(StubServerError::Configuration(format!(
                "invalid status code: {}",
                self.status
            )));
        }
        for (name, value) in &self.headers {
            hyper::header::HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                StubServerError::Configuration(format!("invalid header name: {name:?}"))
            })?;
            hyper::header::HeaderValue::from_str(value).map_err(|_| {
                StubServerError::Configuration(format!("invalid value for header {name}"))
            })?;
        }
        Ok(())
    }

    /// Produce the response for `request`.
    pub fn render(&self, request: &Request, engine: &TemplateEngine) -> Result<RawResponse> {
        let body = match &self.body {
            BodySource::Empty => Bytes::new(),
            BodySource::Json { encoded, .. } => encoded.clone(),
            BodySource::Text(content)
            | BodySource::Bytes(content)
            | BodySource::File { content, .. } => content.clone(),
            BodySource::Template(source) => engine
                .render(source, request)
                .map(Bytes::from)
                .map_err(|e| StubServerError::Render(e.to_string()))?,
        };

        let mut response = RawResponse {
            status: self.status,
            headers: Vec::with_capacity(self.headers.len() + 2),
            body,
        };

        let has_content_type = self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            if let Some(content_type) = self.body.default_content_type() {
                response
                    .headers
                    .push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        // Content-Length always reflects the rendered body
        response.headers.extend(
            self.headers
                .iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case("content-length"))
                .cloned(),
        );
        response
            .headers
            .push(("Content-Length".to_string(), response.body.len().to_string()));

        Ok(response)
    }
}

impl From<&str> for ResponseTemplate {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for ResponseTemplate {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<Value> for ResponseTemplate {
    fn from(value: Value) -> Self {
        Self::json(value)
    }
}

/// A rendered response, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawResponse {
    /// Fallback when no rule matches.
    pub fn not_found() -> Self {
        Self::plain(404, "No matching rule")
    }

    pub fn internal_error() -> Self {
        Self::plain(500, "Failed to render response")
    }

    pub fn bad_request() -> Self {
        Self::plain(400, "Bad request")
    }

    fn plain(status: u16, message: &'static str) -> Self {
        Self {
            status,
            headers: vec![
                (
                    "Content-Type".to_string(),
                    "text/plain; charset=utf-8".to_string(),
                ),
                ("Content-Length".to_string(), message.len().to_string()),
            ],
            body: Bytes::from_static(message.as_bytes()),
        }
    }

    /// Case-insensitive lookup of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
