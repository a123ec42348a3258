//! HTTP Stub Server
//!
//! A declarative HTTP/1.1 stub server for integration tests. Incoming
//! requests are checked against an ordered list of rules and the first
//! matching rule's response is returned.
//!
//! # Features
//!
//! - **Request Matching**: method, URI (exact, prefix, regex, glob), headers,
//!   query parameters, text and JSON bodies, JSON paths, `and`/`or`/`not`
//! - **Responses**: text, JSON, raw bytes, files and Handlebars templates,
//!   with status, headers and simulated latency
//! - **Configuration**: JSON or YAML rulesets, inline or from disk
//! - **Scoped Lifecycle**: [`running`] stops the server on every exit path
//!
//! # Example Configuration
//!
//! ```yaml
//! - description: good card
//!   request:
//!     method: POST
//!     json_path:
//!       - path: $..cc_number
//!         match: "4(111|444)[0-9]{12}"
//!       - path: amount
//!         gte: 10
//!   response:
//!     text: success
//! - response:
//!     status: 402
//!     json:
//!       error: declined
//! ```

pub mod config;
pub mod error;
pub mod matcher;
pub mod request;
pub mod response;
pub mod rule;
pub mod server;
pub mod template;

pub use config::{ConfigLoader, ConfigSource};
pub use error::{Result, StubServerError};
pub use matcher::{Matcher, ValuePredicate};
pub use request::Request;
pub use response::{Latency, RawResponse, ResponseTemplate};
pub use rule::{Rule, RuleTable};
pub use server::{running, ServerOptions, ServerState, ServerStats, StubServer};
pub use template::TemplateEngine;
