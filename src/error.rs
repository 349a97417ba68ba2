//! Error types for db-dispatch.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants follow the failure taxonomy of the dispatch layer: configuration,
//! driver availability, acquisition, query execution, pool lifecycle hooks,
//! transactions and dialect capabilities.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Driver '{driver}' is not available: {guidance}")]
    DriverUnavailable { driver: String, guidance: String },

    #[error("There is no pool defined on the current client")]
    NoPoolDefined,

    #[error("Connection pool is closed (endpoint: {endpoint})")]
    PoolClosed { endpoint: String },

    #[error("Connection acquisition aborted: {reason}")]
    AcquireAborted { reason: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Pool hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    /// A driver failure enriched with the rendered statement that caused it.
    #[error("{statement} - {message}")]
    Query {
        statement: String,
        message: String,
        sql_state: Option<String>,
    },

    /// A non-driver failure (timeout, connection loss, ...) raised while
    /// running a statement. Keeps the original error as its source.
    #[error("{statement} - {source}")]
    Statement {
        statement: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("{operation} is not supported by the {dialect} dialect")]
    Unsupported { operation: String, dialect: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a driver-unavailable error with installation guidance.
    pub fn driver_unavailable(driver: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self::DriverUnavailable {
            driver: driver.into(),
            guidance: guidance.into(),
        }
    }

    /// Create a pool-closed error for an endpoint.
    pub fn pool_closed(endpoint: impl Into<String>) -> Self {
        Self::PoolClosed {
            endpoint: endpoint.into(),
        }
    }

    /// Create an acquire-aborted error.
    pub fn acquire_aborted(reason: impl Into<String>) -> Self {
        Self::AcquireAborted {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a pool hook error.
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a capability error.
    pub fn unsupported(operation: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            dialect: dialect.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Prefix the error with the statement that produced it.
    ///
    /// Driver errors become [`DbError::Query`]; anything else is wrapped in
    /// [`DbError::Statement`] so its kind stays inspectable. Errors that are
    /// already enriched are returned unchanged.
    pub fn with_statement(self, statement: impl Into<String>) -> Self {
        match self {
            Self::Query { .. } | Self::Statement { .. } => self,
            Self::Database {
                message, sql_state, ..
            } => Self::Query {
                statement: statement.into(),
                message,
                sql_state,
            },
            other => Self::Statement {
                statement: statement.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error underneath any statement enrichment.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Statement { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::DriverUnavailable { guidance, .. } => Some(guidance),
            _ => None,
        }
    }

    /// Get the SQL state reported by the driver, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self.root() {
            Self::Database { sql_state, .. } | Self::Query { sql_state, .. } => {
                sql_state.as_deref()
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Nothing in this crate retries on its own; callers use this to decide.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error reports a missing dialect capability.
    pub fn is_capability_error(&self) -> bool {
        matches!(self.root(), Self::Unsupported { .. })
    }
}

/// Convert sqlx errors to DbError.
#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check the database file path and permissions",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database driver compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_no_pool_message() {
        assert_eq!(
            DbError::NoPoolDefined.to_string(),
            "There is no pool defined on the current client"
        );
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(err.sql_state(), Some("42601"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("acquire", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::NoPoolDefined.is_retryable());
    }

    #[test]
    fn test_with_statement_prefixes_message() {
        let err = DbError::database("no such table: t", None, "check")
            .with_statement("SELECT * FROM t");
        assert_eq!(err.to_string(), "SELECT * FROM t - no such table: t");
    }

    #[test]
    fn test_with_statement_keeps_sql_state() {
        let err = DbError::database("boom", Some("XX000".to_string()), "check")
            .with_statement("SELECT 1");
        assert_eq!(err.sql_state(), Some("XX000"));
    }

    #[test]
    fn test_with_statement_is_not_applied_twice() {
        let err = DbError::internal("x")
            .with_statement("SELECT 1")
            .with_statement("SELECT 2");
        assert!(err.to_string().starts_with("SELECT 1 - "));
    }

    #[test]
    fn test_with_statement_keeps_timeout_kind() {
        let err = DbError::timeout("query", 1000).with_statement("SELECT pg_sleep(5)");
        assert!(matches!(err, DbError::Statement { .. }));
        assert!(matches!(err.root(), DbError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "SELECT pg_sleep(5) - Timeout: query exceeded 1000ms"
        );
    }

    #[test]
    fn test_capability_error_is_distinguishable() {
        let err = DbError::unsupported("Query cancellation", "generic");
        assert!(err.is_capability_error());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Query cancellation is not supported by the generic dialect"
        );
    }
}
