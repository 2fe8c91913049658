//! Error types for delivery operations.
//!
//! Covers failed delivery attempts (transport errors and HTTP statuses at or
//! above 400), worker pool failures, and store errors surfaced through the
//! coordinator. Each error knows whether another delivery attempt makes sense
//! and whether it must end the run.

use std::fmt;

use courier_core::StoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering records.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The endpoint could not be reached or the connection broke.
    #[error("endpoint unreachable: {message}")]
    NetworkError {
        /// Transport error text
        message: String,
    },

    /// No response within the per-request timeout.
    #[error("endpoint did not answer within {timeout_seconds}s")]
    Timeout {
        /// Configured request timeout
        timeout_seconds: u64,
    },

    /// Endpoint rejected the record with a 4xx status.
    #[error("endpoint rejected record: HTTP {status_code}")]
    ClientError {
        /// Status in 400..500
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Endpoint failed with a 5xx status.
    #[error("endpoint failed: HTTP {status_code}")]
    ServerError {
        /// Status of 500 or above
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Store operation failed outside a worker.
    #[error("store error: {message}")]
    StoreError {
        /// Store error message
        message: String,
    },

    /// A delivery outcome could not be persisted; the pool was drained.
    #[error("worker fatal error: {message}")]
    WorkerFatal {
        /// Description of the failed persistence
        message: String,
    },

    /// A worker task panicked or was aborted.
    #[error("worker {worker_id} terminated abnormally: {message}")]
    WorkerPanic {
        /// Index of the failed worker
        worker_id: usize,
        /// Join error description
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker pool did not stop within {timeout_seconds}s")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout_seconds: u64,
    },

    /// Invalid delivery configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Offending setting and why
        message: String,
    },

    /// The coordinator went away while a worker was still running.
    #[error("delivery stopped by shutdown")]
    ShutdownRequested,

    /// Broken coordinator bookkeeping, such as a closed event channel.
    #[error("coordinator invariant broken: {message}")]
    InternalError {
        /// What went wrong
        message: String,
    },
}

impl DeliveryError {
    /// Creates a transport error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a request timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates the error for a failing HTTP status.
    ///
    /// Statuses from 500 up are server errors, everything else client errors.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        if status_code >= 500 {
            Self::ServerError { status_code, body: body.into() }
        } else {
            Self::ClientError { status_code, body: body.into() }
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError { message: message.into() }
    }

    /// Creates a worker fatal error.
    pub fn worker_fatal(message: impl Into<String>) -> Self {
        Self::WorkerFatal { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether another delivery attempt should follow this failure.
    ///
    /// Every transport failure and every HTTP status at or above 400 counts
    /// against the attempt budget and is retried while budget remains.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ClientError { .. }
            | Self::ServerError { .. } => true,

            Self::StoreError { .. }
            | Self::WorkerFatal { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownRequested
            | Self::InternalError { .. } => false,
        }
    }

    /// Whether this error must terminate the process with a failure exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreError { .. }
                | Self::WorkerFatal { .. }
                | Self::WorkerPanic { .. }
                | Self::ShutdownTimeout { .. }
                | Self::InternalError { .. }
        )
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::store(error.to_string())
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// 4xx responses.
    Client,
    /// 5xx responses.
    Server,
    /// Store operations.
    Store,
    /// Worker pool failures.
    Worker,
    /// Rejected settings.
    Configuration,
    /// Coordinator bugs.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::StoreError { .. } | DeliveryError::WorkerFatal { .. } => Self::Store,
            DeliveryError::WorkerPanic { .. } | DeliveryError::ShutdownTimeout { .. } => {
                Self::Worker
            },
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Store => write!(f, "store"),
            Self::Worker => write!(f, "worker"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_failures_are_retryable() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(10).is_retryable());
        assert!(DeliveryError::http_status(500, "internal server error").is_retryable());
        assert!(DeliveryError::http_status(404, "not found").is_retryable());

        assert!(!DeliveryError::worker_fatal("mark_processed failed").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn fatal_errors_identified() {
        assert!(DeliveryError::worker_fatal("mark_retried failed").is_fatal());
        assert!(DeliveryError::from(StoreError::NoTransaction).is_fatal());
        assert!(DeliveryError::WorkerPanic { worker_id: 3, message: "boom".into() }.is_fatal());

        assert!(!DeliveryError::ShutdownRequested.is_fatal());
        assert!(!DeliveryError::http_status(503, "").is_fatal());
    }

    #[test]
    fn http_status_split_by_class() {
        assert!(matches!(
            DeliveryError::http_status(400, "bad request"),
            DeliveryError::ClientError { status_code: 400, .. }
        ));
        assert!(matches!(
            DeliveryError::http_status(502, ""),
            DeliveryError::ServerError { status_code: 502, .. }
        ));
        assert_eq!(ErrorCategory::from(&DeliveryError::http_status(429, "")), ErrorCategory::Client);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(10).to_string(), "endpoint did not answer within 10s");
        assert_eq!(
            DeliveryError::from(StoreError::NoTransaction).to_string(),
            "store error: no open transaction"
        );
    }
}
