//! Error types for the stub server.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors raised while configuring or starting a stub server.
///
/// Per-request failures (unmatched requests, malformed input, write errors)
/// are answered on the connection and never surface here, except
/// [`StubServerError::Render`] which the dispatcher turns into a 500.
#[derive(Debug, thiserror::Error)]
pub enum StubServerError {
    /// The ruleset as a whole could not be parsed.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A single rule is malformed.
    #[error("invalid rule at index {index}: {message}")]
    InvalidRule { index: usize, message: String },

    /// A file referenced by the configuration could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running on {0}")]
    AlreadyRunning(SocketAddr),

    /// A dynamic body failed to render.
    #[error("failed to render response: {0}")]
    Render(String),
}

impl StubServerError {
    /// Whether this error means the server must refuse to start.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidRule { .. } | Self::File { .. }
        )
    }

    /// Attach a rule index to a rule-level error that has none yet.
    pub(crate) fn at_rule(self, index: usize) -> Self {
        match self {
            Self::Configuration(message) => Self::InvalidRule { index, message },
            Self::File { path, source } => Self::InvalidRule {
                index,
                message: format!("failed to read {}: {}", path.display(), source),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StubServerError>;
