//! Handlebars rendering for dynamic response bodies.
//!
//! Templates see the request as `method`, `uri`, `query`, `headers`, `body`
//! and `json` (the parsed body, when it is JSON).

use crate::error::{Result, StubServerError};
use crate::request::Request;
use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Data exposed to templates.
#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    method: &'a str,
    uri: &'a str,
    query: HashMap<String, String>,
    headers: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<&'a serde_json::Value>,
}

impl<'a> TemplateContext<'a> {
    fn from_request(request: &'a Request) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            query: request.query_params(),
            headers: request.headers(),
            body: request.body_text(),
            json: request.json(),
        }
    }
}

handlebars_helper!(upper: |s: str| s.to_uppercase());
handlebars_helper!(lower: |s: str| s.to_lowercase());

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("upper", Box::new(upper));
        handlebars.register_helper("lower", Box::new(lower));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));

        // Bodies are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Compile `source` without rendering it.
    pub fn validate(source: &str) -> Result<()> {
        handlebars::Template::compile(source)
            .map(|_| ())
            .map_err(|e| StubServerError::Configuration(format!("invalid template: {e}")))
    }

    pub fn render(
        &self,
        source: &str,
        request: &Request,
    ) -> std::result::Result<String, handlebars::RenderError> {
        let ctx = TemplateContext::from_request(request);
        self.handlebars.render_template(source, &ctx)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

/// `{{now}}` or `{{now "%Y-%m-%d"}}`, in UTC.
fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    // chrono reports unknown specifiers through fmt::Error
    let mut rendered = String::new();
    write!(rendered, "{}", chrono::Utc::now().format(format)).map_err(|_| {
        handlebars::RenderErrorReason::Other(format!("invalid date format: {format}"))
    })?;
    out.write(&rendered)?;
    Ok(())
}

/// `{{random min max}}`, inclusive; defaults to 0..=100.
fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);

    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: the fallback when value is missing, null or "".
fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let fallback = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    let rendered = match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) | None => {
            fallback.to_string()
        }
        Some(other) => other.to_string(),
    };
    out.write(&rendered)?;
    Ok(())
}
