//! Error types for policyserve.
//!
//! Every failure a caller can observe maps onto one of the variants below, and
//! [`Error::category`] folds them into the three situations a caller has to
//! tell apart: the backend is gone, the input was rejected, or the call was
//! merely slow.

use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};

/// Boxed transport error kept as the source of RPC and gateway failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized Result type for policyserve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for policyserve operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected tensor shape or layout
    #[error("Shape error: {0}")]
    Shape(String),

    /// Missing or corrupt model artifact
    #[error("Load error: {0}")]
    Load(String),

    /// Backend unreachable at construction time
    #[error("Connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    /// Backend reachable but the requested model is not being served
    #[error("Model {model} version {version} is not ready: {reason}")]
    NotReady {
        model: String,
        version: String,
        reason: String,
    },

    /// Call exceeded its deadline; the backend stays usable
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Transport-level failure on the tensor RPC channel
    #[error("RPC error: {message}")]
    Rpc {
        message: String,
        #[source]
        source: BoxError,
    },

    /// Non-2xx answer or transport failure talking to the JSON gateway
    #[error("Gateway error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Gateway {
        status: Option<u16>,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Model forward pass failed for one request
    #[error("Inference error: {0}")]
    Inference(String),

    /// Request dropped because the backend or host is shutting down
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Arrow encoding errors
    #[error("Arrow error: {0}")]
    Arrow(String),
}

/// What a caller should conclude from an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Backend cannot be reached or is not serving; reconnect or fail over
    Unreachable,
    /// The model refused this particular input; fix the input, do not retry
    InputRejected,
    /// Transient condition; retrying the same call may succeed
    Transient,
    /// Configuration, artifact or internal failure
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Unreachable => "unreachable",
            ErrorCategory::InputRejected => "input_rejected",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

impl Error {
    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub fn rpc(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Rpc {
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Shape(_) => ErrorCategory::InputRejected,
            Error::Connection { .. } | Error::NotReady { .. } | Error::Cancelled(_) => {
                ErrorCategory::Unreachable
            }
            Error::Timeout { .. } | Error::Rpc { .. } => ErrorCategory::Transient,
            Error::Gateway { status, .. } => match status {
                Some(422) | Some(400) => ErrorCategory::InputRejected,
                Some(503) => ErrorCategory::Unreachable,
                Some(504) | Some(502) | None => ErrorCategory::Transient,
                Some(_) => ErrorCategory::Fatal,
            },
            Error::Inference(_)
            | Error::Load(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Arrow(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Error::Arrow(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Shape(msg) => Status::invalid_argument(msg),
            Error::Load(msg) => Status::failed_precondition(format!("Load error: {}", msg)),
            Error::NotReady { model, version, reason } => Status::unavailable(format!(
                "Model {} version {} is not ready: {}",
                model, version, reason
            )),
            Error::Cancelled(msg) => Status::cancelled(msg),
            Error::Timeout { operation, after } => {
                Status::deadline_exceeded(format!("{} timed out after {:?}", operation, after))
            }
            Error::Config(msg) => Status::failed_precondition(format!("Config error: {}", msg)),
            Error::Inference(msg) => Status::internal(format!("Inference error: {}", msg)),
            other => Status::internal(other.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::InvalidArgument => Error::Shape(status.message().to_string()),
            Code::Cancelled => Error::Cancelled(status.message().to_string()),
            Code::DeadlineExceeded => Error::Timeout {
                operation: "remote call",
                after: Duration::ZERO,
            },
            _ => Error::Rpc {
                message: status.message().to_string(),
                source: Box::new(status),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_separate_recovery_paths() {
        let unreachable = Error::Connection {
            endpoint: "http://127.0.0.1:1".into(),
            source: "refused".into(),
        };
        let rejected = Error::shape("unexpected image layout");
        let transient = Error::Timeout {
            operation: "predict",
            after: Duration::from_millis(10),
        };

        assert_eq!(unreachable.category(), ErrorCategory::Unreachable);
        assert_eq!(rejected.category(), ErrorCategory::InputRejected);
        assert_eq!(transient.category(), ErrorCategory::Transient);
        assert!(transient.is_timeout());
    }

    #[test]
    fn test_gateway_status_categories() {
        let err = |status| Error::Gateway {
            status: Some(status),
            message: String::new(),
            source: None,
        };
        assert_eq!(err(422).category(), ErrorCategory::InputRejected);
        assert_eq!(err(503).category(), ErrorCategory::Unreachable);
        assert_eq!(err(504).category(), ErrorCategory::Transient);
        assert_eq!(err(500).category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_status_round_trip_keeps_shape_errors() {
        let status: Status = Error::shape("bad image").into();
        assert_eq!(status.code(), Code::InvalidArgument);

        let back: Error = status.into();
        assert!(matches!(back, Error::Shape(msg) if msg == "bad image"));
    }

    #[test]
    fn test_rpc_error_preserves_source() {
        use std::error::Error as _;

        let err: Error = Status::internal("boom").into();
        assert!(matches!(err, Error::Rpc { .. }));
        assert!(err.source().is_some());
    }
}
