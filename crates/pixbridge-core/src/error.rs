//! Error types for the command bridge.
//!
//! Every failure the bridge can report maps onto one stable [`ErrorKind`], which is
//! the string that travels in a response's `error.kind` field and the value the
//! caller-facing outcome carries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Stable failure taxonomy shared by both ends of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedFrame,
    UnknownOperation,
    ValidationError,
    HandlerExecutionError,
    Timeout,
    ConnectionRefused,
    ConnectionLost,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedFrame => "MalformedFrame",
            ErrorKind::UnknownOperation => "UnknownOperation",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::HandlerExecutionError => "HandlerExecutionError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ConnectionRefused => "ConnectionRefused",
            ErrorKind::ConnectionLost => "ConnectionLost",
        }
    }

}

impl FromStr for ErrorKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MalformedFrame" => Ok(ErrorKind::MalformedFrame),
            "UnknownOperation" => Ok(ErrorKind::UnknownOperation),
            "ValidationError" => Ok(ErrorKind::ValidationError),
            "HandlerExecutionError" => Ok(ErrorKind::HandlerExecutionError),
            "Timeout" => Ok(ErrorKind::Timeout),
            "ConnectionRefused" => Ok(ErrorKind::ConnectionRefused),
            "ConnectionLost" => Ok(ErrorKind::ConnectionLost),
            other => Err(BridgeError::malformed(format!("unknown error kind '{}'", other))),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("Unknown operation: {operation}")]
    UnknownOperation { operation: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Operation '{operation}' failed: {message}")]
    HandlerExecution { operation: String, message: String },

    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Connection refused by {addr}: {message}")]
    ConnectionRefused { addr: String, message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::MalformedFrame {
            message: format!("invalid JSON payload: {}", err),
        }
    }
}

impl BridgeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        BridgeError::MalformedFrame {
            message: message.into(),
        }
    }

    pub fn lost(message: impl Into<String>) -> Self {
        BridgeError::ConnectionLost {
            message: message.into(),
        }
    }

    /// Wire-level kind for this error.
    ///
    /// Configuration problems surface as validation failures: they are caught
    /// before anything reaches the server.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::MalformedFrame { .. } => ErrorKind::MalformedFrame,
            BridgeError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            BridgeError::Validation { .. } | BridgeError::Config { .. } => {
                ErrorKind::ValidationError
            }
            BridgeError::HandlerExecution { .. } => ErrorKind::HandlerExecutionError,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::ConnectionRefused { .. } => ErrorKind::ConnectionRefused,
            BridgeError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
        }
    }

    /// Whether calling again may succeed without changing the request.
    ///
    /// Transport-level failures are soft for every operation alike.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. }
                | BridgeError::ConnectionRefused { .. }
                | BridgeError::ConnectionLost { .. }
        )
    }

    /// Rebuild an error from a server response's `error` object.
    pub fn from_remote(operation: &str, kind: &str, message: String) -> Self {
        match kind.parse::<ErrorKind>().ok() {
            Some(ErrorKind::MalformedFrame) => BridgeError::MalformedFrame { message },
            Some(ErrorKind::UnknownOperation) => BridgeError::UnknownOperation {
                operation: operation.to_string(),
            },
            Some(ErrorKind::ValidationError) => BridgeError::Validation {
                field: "arguments".to_string(),
                message,
            },
            Some(ErrorKind::Timeout) => BridgeError::Timeout {
                operation: operation.to_string(),
                timeout: Duration::ZERO,
            },
            Some(ErrorKind::ConnectionLost) => BridgeError::ConnectionLost { message },
            // Anything else the host reports is its own execution failure.
            _ => BridgeError::HandlerExecution {
                operation: operation.to_string(),
                message,
            },
        }
    }

    /// Human-readable message without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            BridgeError::MalformedFrame { message }
            | BridgeError::HandlerExecution { message, .. }
            | BridgeError::ConnectionLost { message }
            | BridgeError::Config { message } => message.clone(),
            BridgeError::Validation { field, message } => format!("{}: {}", field, message),
            BridgeError::UnknownOperation { operation } => {
                format!("no handler registered for '{}'", operation)
            }
            BridgeError::Timeout { operation, timeout } => {
                format!("'{}' got no response within {:?}", operation, timeout)
            }
            BridgeError::ConnectionRefused { addr, message } => {
                format!("{} ({})", addr, message)
            }
        }
    }
}

/// Failure raised by a host-side handler.
///
/// Handlers run on the host's mutation thread and report failures through this
/// type; the listener turns it into the response's `error` object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    /// The host call itself failed.
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::HandlerExecutionError,
            message: message.into(),
        }
    }

    /// The arguments were not acceptable to the host.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ValidationError,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::invalid(format!("invalid arguments: {}", err))
    }
}
