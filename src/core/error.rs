/// Session Error Module
///
/// This module defines the error taxonomy of the session engine. Every
/// facade operation returns one of these variants so that callers can render
/// structured messages ("connection busy", "transaction already open")
/// instead of raw driver codes.
use crate::core::db::DriverError;
use thiserror::Error;

/// Error type for every operation exposed by the session engine.
///
/// Covers:
/// - Connection lookup and per-connection exclusivity
/// - Driver failures (raw code and message are preserved)
/// - Cancellation and transaction bookkeeping
/// - Async query lookup
/// - Configuration, file system access and JSON encoding
#[derive(Error, Debug)]
pub enum SessionError {
    /// The connection id is not registered
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Another statement already owns the connection's query driver
    #[error("Connection busy: {connection_id} is already executing {}", .query_id.as_deref().unwrap_or("an exclusive operation"))]
    ConnectionConflict {
        connection_id: String,
        query_id: Option<String>,
    },

    /// Errors reported by the underlying database driver
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// The operation was cancelled before it could finish
    #[error("Query cancelled")]
    Cancelled,

    /// Begin while active, or commit/rollback with no open transaction
    #[error("Transaction error: {0}")]
    TransactionState(String),

    /// The submitted text contains no statement
    #[error("Cannot execute empty SQL query - please provide a valid SQL statement")]
    EmptyQuery,

    /// Unknown or already removed async query id
    #[error("Query not found: {0}")]
    QueryNotFound(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a response as JSON failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Short machine-readable tag for transports that map errors to codes.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConnectionNotFound(_) => "ConnectionNotFound",
            SessionError::ConnectionConflict { .. } => "ConnectionConflict",
            SessionError::Driver(_) => "DriverError",
            SessionError::Cancelled => "CancelledError",
            SessionError::TransactionState(_) => "TransactionStateError",
            SessionError::EmptyQuery => "EmptyQuery",
            SessionError::QueryNotFound(_) => "NotFound",
            SessionError::Config(_) => "ConfigError",
            SessionError::Io(_) => "IoError",
            SessionError::Json(_) => "JsonError",
        }
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}

/// Type alias for Result to use SessionError as the error type.
pub type Result<T> = std::result::Result<T, SessionError>;
