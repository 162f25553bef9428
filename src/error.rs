//! Error types for the copilot service.
//!
//! `CopilotError` is the internal error enum; `ErrorCode` is the closed set of
//! machine-readable codes that cross the HTTP boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for copilot operations.
#[derive(Error, Debug)]
pub enum CopilotError {
    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors (syntax errors, constraint violations, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// LLM API errors (rate limits, auth, timeouts, etc.)
    #[error("LLM error: {0}")]
    Llm(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Knowledge store errors (SQLite failures, migrations).
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Session resolution errors (stale or unknown session ids).
    #[error("Session error: {0}")]
    Session(String),

    /// The operation was cancelled before it finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CopilotError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates an LLM error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates a session error with the given message.
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Llm(_) => "LLM Error",
            Self::Config(_) => "Configuration Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Session(_) => "Session Error",
            Self::Cancelled => "Cancelled",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using CopilotError.
pub type Result<T> = std::result::Result<T, CopilotError>;

/// Machine-readable error codes returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The connection session id is unknown or expired.
    InvalidSession,
    /// Neither a connection session id nor a connection id was supplied.
    MissingConnection,
    /// The AI backend failed (transport, timeout, provider error).
    AiError,
    /// The AI answered but no SQL could be extracted.
    NoSqlGenerated,
    /// The AI is unavailable and no fallback pattern matched.
    CopilotUnavailable,
    /// The request body was malformed.
    InvalidRequest,
    /// The SQL could not be parsed.
    InvalidSql,
    /// The SQL is not allowed on the untrusted path.
    UnsafeSql,
    /// The SQL modifies data on a read-only connection.
    ReadOnlyViolation,
    /// The database rejected the statement.
    ExecutionError,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSession => "INVALID_SESSION",
            Self::MissingConnection => "MISSING_CONNECTION",
            Self::AiError => "AI_ERROR",
            Self::NoSqlGenerated => "NO_SQL_GENERATED",
            Self::CopilotUnavailable => "COPILOT_UNAVAILABLE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidSql => "INVALID_SQL",
            Self::UnsafeSql => "UNSAFE_SQL",
            Self::ReadOnlyViolation => "READ_ONLY_VIOLATION",
            Self::ExecutionError => "EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
