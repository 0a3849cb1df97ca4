//! Error types for changes feed operations
//!
//! Includes error classification so consumers can tell per-event failures
//! from failures that end the stream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration errors (missing `db`, invalid settings)
    Configuration,
    /// Network errors (baseline fetch, transport, bad status)
    Network,
    /// Serialization errors (record rendering, JSON decoding)
    Serialization,
    /// Errors reported by the upstream changes feed
    Feed,
}

/// Changes feed errors
#[derive(Error, Debug)]
pub enum ChangesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Baseline fetch failed in transport, status or body parsing
    #[error("Network error for '{db}': {message}")]
    Network { db: String, message: String },

    /// The database answered but reported no `update_seq`
    #[error("Database '{db}' did not report an update_seq")]
    MissingUpdateSeq { db: String },

    /// Wrapping or rendering a change event failed
    #[error("Adaptation error for change '{id}': {message}")]
    Adaptation { id: String, message: String },

    /// The upstream changes feed failed
    #[error("Feed error: {0}")]
    Feed(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChangesError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error for a target database
    pub fn network(db: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Network {
            db: db.into(),
            message: msg.into(),
        }
    }

    /// Create a new adaptation error for a change id
    pub fn adaptation(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Adaptation {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a new feed error
    pub fn feed(msg: impl Into<String>) -> Self {
        Self::Feed(msg.into())
    }

    /// Whether this error ends the stream it is raised on.
    ///
    /// Baseline failures are fatal because no event can be classified against
    /// an unknown baseline. Adaptation errors are fatal only under the `halt`
    /// policy, which the transform decides; on its own the error is not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Network { .. } | Self::MissingUpdateSeq { .. }
        )
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Yaml(_) => ErrorCategory::Configuration,
            Self::Network { .. } => ErrorCategory::Network,
            Self::MissingUpdateSeq { .. } => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::Adaptation { .. } => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Feed(_) => ErrorCategory::Feed,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Yaml(_) => "yaml_error",
            Self::Network { .. } => "network_error",
            Self::MissingUpdateSeq { .. } => "missing_update_seq",
            Self::Io(_) => "io_error",
            Self::Adaptation { .. } => "adaptation_error",
            Self::Json(_) => "json_error",
            Self::Feed(_) => "feed_error",
        }
    }
}

/// Result type for changes feed operations
pub type Result<T> = std::result::Result<T, ChangesError>;
