//! Error types for store operations and row decoding.
//!
//! Store errors cover connection, statement and transaction-state failures.
//! Decode errors are local to a single claimed row and never abort a batch.

use thiserror::Error;

/// Result type alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`crate::storage::RecordStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// A statement was issued without an open transaction.
    #[error("no open transaction")]
    NoTransaction,

    /// `begin` was called while a transaction was still open.
    #[error("a transaction is already open")]
    TransactionAlreadyOpen,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// The configured table name is not a plain SQL identifier.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// The configured table does not exist.
    #[error("table {table} does not exist")]
    TableNotFound {
        /// Name of the missing table
        table: String,
    },

    /// The table lacks one of the bookkeeping columns.
    #[error("table {table} is missing required column {column}")]
    MissingColumn {
        /// Name of the table
        table: String,
        /// Name of the missing column
        column: String,
    },

    /// A rollback failed while handling another error.
    #[error("{cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        /// Error that triggered the rollback
        cause: Box<StoreError>,
        /// Error returned by the rollback itself
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    /// Creates a database error from a message.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Wraps `cause` with the error of the rollback it triggered.
    pub fn rollback_failed(cause: StoreError, rollback: StoreError) -> Self {
        Self::RollbackFailed { cause: Box::new(cause), rollback: Box::new(rollback) }
    }

    /// Returns true for errors that make the store unusable at startup.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidTableName(_) | Self::TableNotFound { .. } | Self::MissingColumn { .. }
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// A claimed row could not be turned into a [`crate::models::Record`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A bookkeeping column is absent from the row.
    #[error("missing column {0}")]
    MissingColumn(&'static str),

    /// A column holds a value of the wrong type.
    #[error("column {column} has type {found}, expected {expected}")]
    InvalidType {
        /// Column name
        column: String,
        /// Expected type description
        expected: &'static str,
        /// Description of the value actually found
        found: String,
    },

    /// A column that must be set holds NULL.
    #[error("column {column} is NULL")]
    NullValue {
        /// Column name
        column: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_failure_keeps_both_messages() {
        let error = StoreError::rollback_failed(
            StoreError::database("relation is locked"),
            StoreError::database("connection reset"),
        );

        let message = error.to_string();
        assert!(message.contains("relation is locked"));
        assert!(message.contains("connection reset"));
    }

    #[test]
    fn startup_fatal_errors_identified() {
        assert!(StoreError::TableNotFound { table: "customers".into() }.is_startup_fatal());
        assert!(StoreError::InvalidTableName("drop table".into()).is_startup_fatal());
        assert!(!StoreError::NoTransaction.is_startup_fatal());
        assert!(!StoreError::database("timeout").is_startup_fatal());
    }
}
