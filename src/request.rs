//! Normalized view of an incoming HTTP request.
//!
//! Matchers and templates never see hyper types; the server converts each
//! request into a [`Request`] once, after the body has been fully read.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// An incoming request, as seen by matchers and templates.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    uri: String,
    query: Option<String>,
    /// Header names are stored lower-cased.
    headers: HashMap<String, String>,
    body: Bytes,
    json: OnceLock<Option<Value>>,
}

impl Request {
    /// Create a request with an empty body. `uri` may carry a query string.
    pub fn new(method: impl Into<String>, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (uri.to_string(), None),
        };
        Self {
            method: method.into(),
            uri: path,
            query,
            headers: HashMap::new(),
            body: Bytes::new(),
            json: OnceLock::new(),
        }
    }

    /// Build from the pieces of a hyper request.
    pub fn from_parts(
        method: &hyper::Method,
        uri: &hyper::Uri,
        headers: &hyper::HeaderMap,
        body: Bytes,
    ) -> Self {
        let mut request = Self::new(method.as_str(), uri.path());
        request.query = uri.query().map(String::from);
        for (name, value) in headers {
            // Repeated headers keep their first value
            if let Ok(value) = value.to_str() {
                request
                    .headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        request.body = body;
        request
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.json = OnceLock::new();
        self
    }

    /// Set a JSON body and the matching content type.
    pub fn with_json(self, value: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path, without the query string.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Parsed JSON body, computed on first access.
    ///
    /// `None` when the body is empty or not valid JSON.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| {
                if self.body.is_empty() {
                    None
                } else {
                    serde_json::from_slice(&self.body).ok()
                }
            })
            .as_ref()
    }

    /// Decoded query parameters. Later duplicates win.
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query_string(self.query.as_deref().unwrap_or(""))
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params().remove(name)
    }
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

/// Decode `%XX` escapes and `+` as space. Invalid escapes are kept verbatim.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_and_query_split() {
        let request = Request::new("GET", "/search?q=rust&page=2");
        assert_eq!(request.uri(), "/search");
        assert_eq!(request.query(), Some("q=rust&page=2"));
        assert_eq!(request.query_param("page").as_deref(), Some("2"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = Request::new("GET", "/").with_header("X-Api-Key", "secret");
        assert_eq!(request.header("x-api-key"), Some("secret"));
        assert_eq!(request.header("X-API-KEY"), Some("secret"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn test_json_body_parsed() {
        let request = Request::new("POST", "/").with_body(r#"{"amount": 10}"#);
        assert_eq!(request.json().unwrap()["amount"], 10);
        // Second access hits the cached value
        assert!(request.json().is_some());
    }

    #[test]
    fn test_invalid_json_is_none() {
        let request = Request::new("POST", "/").with_body("amount=10");
        assert!(request.json().is_none());

        let empty = Request::new("POST", "/");
        assert!(empty.json().is_none());
    }

    #[test]
    fn test_with_body_resets_json_cache() {
        let request = Request::new("POST", "/").with_body("not json");
        assert!(request.json().is_none());
        let request = request.with_body("[1, 2]");
        assert!(request.json().is_some());
    }

    #[test]
    fn test_percent_decoding() {
        let params = parse_query_string("name=John%20Doe&city=S%C3%A3o+Paulo&flag");
        assert_eq!(params.get("name").map(String::as_str), Some("John Doe"));
        assert_eq!(params.get("city").map(String::as_str), Some("São Paulo"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));

        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_from_parts() {
        let uri: hyper::Uri = "/foo?x=1".parse().unwrap();
        let mut headers = hyper::HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());

        let request = Request::from_parts(
            &hyper::Method::POST,
            &uri,
            &headers,
            Bytes::from_static(b"{}"),
        );
        assert_eq!(request.method(), "POST");
        assert_eq!(request.uri(), "/foo");
        assert_eq!(request.query(), Some("x=1"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert!(request.json().is_some());
    }
}
