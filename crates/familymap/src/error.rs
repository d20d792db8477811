//! Error types for familymap.
//!
//! This module defines the error types used throughout the familymap crate,
//! grouped by the collaborator that produced them.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for familymap operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Local Cache Errors ===
    /// Failed to open or create the cache database.
    #[error("failed to open cache database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A cache query failed.
    #[error("cache query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run cache migrations.
    #[error("cache migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Auth Errors ===
    /// The auth service rejected the request.
    #[error("{message}")]
    Auth {
        /// Message reported by the auth service.
        message: String,
    },

    /// Credentials failed local validation before reaching the backend.
    #[error("invalid credentials: {message}")]
    InvalidCredentials {
        /// Which field failed and why.
        message: String,
    },

    /// The operation needs an authenticated session.
    #[error("not signed in")]
    NotSignedIn,

    // === Backend Errors ===
    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {message}")]
    Backend {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The realtime channel failed.
    #[error("realtime error: {0}")]
    Realtime(String),

    /// The realtime websocket failed.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    // === Device Errors ===
    /// A position source failed to start watching.
    #[error("failed to start position source '{name}': {message}")]
    DeviceStart {
        /// Name of the position source.
        name: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    // === Render Errors ===
    /// Producing or presenting a view failed.
    #[error("render error: {0}")]
    Render(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for familymap operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl Error {
    /// Create a new auth error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new realtime error.
    #[must_use]
    pub fn realtime(message: impl Into<String>) -> Self {
        Self::Realtime(message.into())
    }

    /// Create a new render error.
    #[must_use]
    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a device start error.
    #[must_use]
    pub fn device_start(name: &'static str, message: impl Into<String>) -> Self {
        Self::DeviceStart {
            name,
            message: message.into(),
        }
    }

    /// Create a backend status error.
    #[must_use]
    pub fn backend(status: u16, message: impl Into<String>) -> Self {
        Self::Backend {
            status,
            message: message.into(),
        }
    }

    /// Check if this error should be shown to the user as an auth alert.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::InvalidCredentials { .. } | Self::NotSignedIn
        )
    }

    /// Check if this error indicates there is no session.
    #[must_use]
    pub fn is_not_signed_in(&self) -> bool {
        matches!(self, Self::NotSignedIn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotSignedIn;
        assert_eq!(err.to_string(), "not signed in");

        let err = Error::auth("Invalid login credentials");
        assert_eq!(err.to_string(), "Invalid login credentials");
    }

    #[test]
    fn test_is_auth_error() {
        assert!(Error::auth("nope").is_auth_error());
        assert!(Error::NotSignedIn.is_auth_error());
        assert!(Error::InvalidCredentials {
            message: "email".to_string()
        }
        .is_auth_error());
        assert!(!Error::realtime("closed").is_auth_error());
    }

    #[test]
    fn test_is_not_signed_in() {
        assert!(Error::NotSignedIn.is_not_signed_in());
        assert!(!Error::internal("x").is_not_signed_in());
    }

    #[test]
    fn test_backend_error_display() {
        let err = Error::backend(401, "JWT expired");
        let msg = err.to_string();
        assert!(msg.contains("401"));
        assert!(msg.contains("JWT expired"));
    }

    #[test]
    fn test_device_start_error() {
        let err = Error::device_start("gpsd", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("gpsd"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_render_error() {
        let err = Error::render("surface closed");
        assert_eq!(err.to_string(), "render error: surface closed");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/cache.db",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::DatabaseQuery(_)));
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_from_websocket_error() {
        let err: Error = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, Error::WebSocket(_)));
        assert!(err.to_string().contains("websocket"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "zoom out of range".to_string(),
        };
        assert!(err.to_string().contains("zoom out of range"));
    }

    #[test]
    fn test_timeout_error_display() {
        let err = Error::Timeout {
            operation: "leave realtime channel".to_string(),
        };
        assert!(err.to_string().contains("leave realtime channel"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
