//! Error handling for the sharelog relay
//!
//! Error types covering configuration, file access, replay and stream
//! delivery. Admission rejections live in [`crate::relay::admission`] since
//! they terminate at the HTTP boundary instead of propagating.

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sharelog relay
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// History replay errors
    #[error("Replay error: {message}")]
    Replay { message: String },

    /// The consumer went away while events were being delivered
    #[error("Connection closed: {connection}")]
    ConnectionClosed { connection: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a replay error
    pub fn replay(message: impl Into<String>) -> Self {
        Self::Replay {
            message: message.into(),
        }
    }

    /// Create a connection closed error
    pub fn connection_closed(connection: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            connection: connection.into(),
        }
    }

    /// True when the peer is gone and nothing more can be delivered to it
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. } | Error::WebSocket(_))
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::WebSocket(_) => "websocket",
            Error::Config { .. } => "config",
            Error::Replay { .. } => "replay",
            Error::ConnectionClosed { .. } => "connection_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("bad").category(), "config");
        assert_eq!(Error::replay("boom").category(), "replay");
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(io.category(), "io");
    }

    #[test]
    fn test_connection_closed_detection() {
        assert!(Error::connection_closed("abc").is_connection_closed());
        assert!(!Error::replay("abc").is_connection_closed());
    }

    #[test]
    fn test_error_display() {
        let err = Error::config("Tick interval must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Configuration error: Tick interval must be greater than 0"
        );
    }
}
