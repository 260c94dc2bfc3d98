//! Error types for callmesh.

use std::fmt;

use thiserror::Error;

/// Main error type for all callmesh operations.
#[derive(Debug, Error)]
pub enum CallmeshError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (single-shot path only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload bytes could not be decoded.
    #[error("{}", payload_decode_message(*offset, message))]
    PayloadDecode {
        /// Byte offset where decoding failed, when known.
        offset: Option<u64>,
        /// Decoder message.
        message: String,
    },

    /// Payload could not be encoded.
    #[error("Payload encode error: {0}")]
    PayloadEncode(#[from] rmp_serde::encode::Error),

    /// Payload nesting exceeds the configured depth limit.
    #[error("Payload exceeds maximum nesting depth of {limit}")]
    PayloadTooDeep {
        /// Configured limit.
        limit: usize,
    },

    /// Protocol error (invalid frame, wrong tag, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reading from the connection failed or it closed mid-frame.
    #[error("Transport read error: {0}")]
    TransportRead(String),

    /// Writing to the connection failed (closed, backpressure timeout).
    #[error("Transport write error: {0}")]
    TransportWrite(String),

    /// No registered version satisfies the requested pattern.
    #[error("No version of \"{service}\" matches \"{pattern}\"")]
    NoVersionMatch {
        /// Requested service.
        service: String,
        /// Requested version pattern.
        pattern: String,
    },

    /// Action is not registered for the resolved service version.
    #[error("Action not found: \"{service}\" ({version}) \"{action}\"")]
    ActionNotFound {
        /// Service name.
        service: String,
        /// Concrete version.
        version: String,
        /// Action name.
        action: String,
    },

    /// Parameter failed schema validation.
    #[error("Invalid parameter \"{name}\": {reason}")]
    InvalidParam {
        /// Parameter name.
        name: String,
        /// Why validation failed.
        reason: String,
    },

    /// Deadline expired before a handler or downstream call finished.
    #[error("Timeout after {after_ms} ms")]
    Timeout {
        /// Configured timeout.
        after_ms: u64,
    },

    /// A user handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service definition file could not be parsed.
    #[error("Definition parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn payload_decode_message(offset: Option<u64>, message: &str) -> String {
    match offset {
        Some(offset) => format!("Payload decode error at byte {}: {}", offset, message),
        None => format!("Payload decode error: {}", message),
    }
}

/// Result type alias using CallmeshError.
pub type Result<T> = std::result::Result<T, CallmeshError>;

/// Default error message for handler failures.
pub const DEFAULT_ERROR_MESSAGE: &str = "Unknown error";

/// Default error status for handler failures.
pub const DEFAULT_ERROR_STATUS: &str = "500 Internal Server Error";

/// Error returned by user handlers.
///
/// This is what ends up as an error record inside the reply's Transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub message: String,
    pub code: i64,
    pub status: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: 0,
            status: DEFAULT_ERROR_STATUS.to_string(),
        }
    }

    /// Set the application error code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    /// Set the HTTP status line, e.g. `"404 Not Found"`.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

impl Default for HandlerError {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_MESSAGE)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}, {})", self.message, self.code, self.status)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<CallmeshError> for HandlerError {
    fn from(err: CallmeshError) -> Self {
        match err {
            CallmeshError::Handler(inner) => inner,
            CallmeshError::ActionNotFound { .. } | CallmeshError::NoVersionMatch { .. } => {
                Self::new(err.to_string()).with_status("404 Not Found")
            }
            CallmeshError::InvalidParam { .. } => {
                Self::new(err.to_string()).with_status("400 Bad Request")
            }
            CallmeshError::Timeout { .. } => {
                Self::new(err.to_string()).with_status("504 Gateway Timeout")
            }
            other => Self::new(other.to_string()),
        }
    }
}
