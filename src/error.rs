//! Error types for db-courier.
//!
//! Defines the main error enum used throughout the execution engine.

use thiserror::Error;

/// Main error type for db-courier operations.
#[derive(Error, Debug)]
pub enum CourierError {
    /// The operation kind could not be determined from the request.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A declared table does not appear in the SQL text.
    #[error("Table mismatch: table '{table}' {detail}")]
    TableMismatch { table: String, detail: String },

    /// Tunnel, authentication or network failures, tagged with the connection mode.
    #[error("Connection error ({mode}): {message}")]
    Connection { mode: String, message: String },

    /// Malformed TTL, missing credential fields, unreadable config files.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A null cell was found while null autofill was disabled.
    #[error("Data integrity error: null value in column '{column}' (row {row})")]
    DataIntegrity { row: usize, column: String },

    /// A request reached dispatch with a kind/payload combination that cannot run.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Backend execution errors (syntax errors, permission denied, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// Cache directory or payload errors.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Creates an invalid query error with the given message.
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Creates a table mismatch error for `table`.
    pub fn table_mismatch(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TableMismatch {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// Creates a connection error for the given mode.
    pub fn connection(mode: impl std::fmt::Display, msg: impl Into<String>) -> Self {
        Self::Connection {
            mode: mode.to_string(),
            message: msg.into(),
        }
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a data integrity error for a null cell.
    pub fn data_integrity(row: usize, column: impl Into<String>) -> Self {
        Self::DataIntegrity {
            row,
            column: column.into(),
        }
    }

    /// Creates an unsupported operation error with the given message.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a cache error with the given message.
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "Invalid Query",
            Self::TableMismatch { .. } => "Table Mismatch",
            Self::Connection { .. } => "Connection Error",
            Self::Configuration(_) => "Configuration Error",
            Self::DataIntegrity { .. } => "Data Integrity Error",
            Self::UnsupportedOperation(_) => "Unsupported Operation",
            Self::Query(_) => "Query Error",
            Self::Cache(_) => "Cache Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using CourierError.
pub type Result<T> = std::result::Result<T, CourierError>;
