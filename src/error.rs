//! Error types for docstore-tx.
//!
//! Three layers, all built on `thiserror`:
//! - [`DriverError`]: raw failures raised by a document driver.
//! - [`DataAccessError`]: the driver-independent taxonomy callers program against.
//! - [`ResolverError`] / [`TransactionError`]: misuse of the resolver or the
//!   transaction context.

use thiserror::Error;

/// Raw failure raised by a document driver.
///
/// Drivers map their native errors into this enum; [`DataAccessError`]
/// classifies it further.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Duplicate key: {message}")]
    DuplicateKey { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Command failed ({code}): {message}")]
    Command { code: String, message: String },

    #[error("Handle closed: {message}")]
    Closed { message: String },

    #[error("Invalid database name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

impl DriverError {
    /// Create a duplicate key error.
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::DuplicateKey {
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a command error with a driver-specific code.
    pub fn command(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a closed-handle error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Create an invalid database name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DriverError::duplicate_key(db_err.message())
                } else {
                    let code = db_err
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    DriverError::command(code, db_err.message())
                }
            }
            sqlx::Error::Io(io_err) => DriverError::network(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DriverError::network(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DriverError::network(format!("Protocol error: {}", msg)),
            sqlx::Error::PoolTimedOut => DriverError::network("Timed out acquiring a connection"),
            sqlx::Error::PoolClosed => DriverError::closed("Connection pool is closed"),
            sqlx::Error::Configuration(msg) => DriverError::command("configuration", msg.to_string()),
            sqlx::Error::RowNotFound => DriverError::command("row_not_found", "No rows returned"),
            sqlx::Error::ColumnDecode { index, source } => DriverError::command(
                "decode",
                format!("Failed to decode column {}: {}", index, source),
            ),
            sqlx::Error::Decode(source) => {
                DriverError::command("decode", format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => DriverError::network("Database worker crashed"),
            other => DriverError::command("unknown", other.to_string()),
        }
    }
}

/// Driver-independent data access failure.
///
/// Every variant keeps the originating [`DriverError`] as its source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataAccessError {
    #[error("Data integrity violation: {message}")]
    IntegrityViolation {
        message: String,
        #[source]
        source: DriverError,
    },

    #[error("Data access resource failure: {message}")]
    ResourceFailure {
        message: String,
        #[source]
        source: DriverError,
    },

    #[error("Uncategorized document store error: {message}")]
    UncategorizedStore {
        message: String,
        #[source]
        source: DriverError,
    },
}

impl DataAccessError {
    /// The driver error this failure was translated from.
    pub fn driver_error(&self) -> &DriverError {
        match self {
            Self::IntegrityViolation { source, .. }
            | Self::ResourceFailure { source, .. }
            | Self::UncategorizedStore { source, .. } => source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceFailure { .. })
    }
}

/// Classify a driver error. Every driver error has a category.
impl From<DriverError> for DataAccessError {
    fn from(err: DriverError) -> Self {
        let message = err.to_string();
        match err {
            DriverError::DuplicateKey { .. } => DataAccessError::IntegrityViolation {
                message,
                source: err,
            },
            DriverError::Network { .. } | DriverError::Closed { .. } => {
                DataAccessError::ResourceFailure {
                    message,
                    source: err,
                }
            }
            _ => DataAccessError::UncategorizedStore {
                message,
                source: err,
            },
        }
    }
}

/// Failure while resolving a database handle.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error(transparent)]
    DataAccess(#[from] DataAccessError),
}

impl ResolverError {
    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Create an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }
}

impl From<DriverError> for ResolverError {
    fn from(err: DriverError) -> Self {
        ResolverError::DataAccess(err.into())
    }
}

/// Misuse of the transaction synchronization context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Resource {key} is already bound to the current context")]
    ResourceAlreadyBound { key: String },

    #[error("Transaction synchronization is not active")]
    SynchronizationInactive,

    #[error("No transaction context is bound to the current task")]
    NoContext,

    #[error("Transaction context is in use by a completion callback")]
    ContextBusy,
}

/// Result type alias for resolver operations.
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Result type alias for transaction context operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_is_integrity_violation() {
        let err: DataAccessError = DriverError::duplicate_key("E11000 _id 1").into();
        assert!(matches!(err, DataAccessError::IntegrityViolation { .. }));
        assert!(err.to_string().contains("E11000"));
    }

    #[test]
    fn test_network_is_resource_failure() {
        let err: DataAccessError = DriverError::network("connection reset").into();
        assert!(matches!(err, DataAccessError::ResourceFailure { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_closed_is_resource_failure() {
        let err: DataAccessError = DriverError::closed("pool is closed").into();
        assert!(matches!(err, DataAccessError::ResourceFailure { .. }));
    }

    #[test]
    fn test_other_driver_errors_are_uncategorized() {
        for driver_err in [
            DriverError::command("2", "bad value"),
            DriverError::invalid_name("a/b", "slash"),
        ] {
            let err: DataAccessError = driver_err.clone().into();
            assert!(matches!(err, DataAccessError::UncategorizedStore { .. }));
            assert_eq!(err.driver_error(), &driver_err);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_source_chain_preserved() {
        use std::error::Error;
        let err: DataAccessError = DriverError::network("timeout").into();
        let source = err.source().expect("source");
        assert!(source.downcast_ref::<DriverError>().is_some());
    }

    #[test]
    fn test_resolver_error_from_driver_error() {
        let err: ResolverError = DriverError::duplicate_key("dup").into();
        assert!(matches!(
            err,
            ResolverError::DataAccess(DataAccessError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_sqlx_pool_timeout_is_network() {
        let err: DriverError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DriverError::Network { .. }));
    }

    #[test]
    fn test_sqlx_pool_closed_is_closed() {
        let err: DriverError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DriverError::Closed { .. }));
    }

    #[test]
    fn test_sqlx_io_is_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: DriverError = sqlx::Error::Io(io).into();
        assert!(matches!(err, DriverError::Network { .. }));
    }

    #[test]
    fn test_sqlx_row_not_found_is_command() {
        let err: DriverError = sqlx::Error::RowNotFound.into();
        assert_eq!(
            err,
            DriverError::command("row_not_found", "No rows returned")
        );
    }
}
