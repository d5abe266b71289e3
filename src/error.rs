//! Error types for the fleet simulator

use thiserror::Error;

use crate::device::Phase;
use crate::pki::PkiError;
use crate::transport::ApiResponse;

/// Main error type for simulator operations
///
/// Every variant is fatal for the device that produced it. Retryable
/// conditions (a 404 on registration, a non-200 on approval) are handled
/// inside the lifecycle and only surface here once a bound is exceeded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The server answered a step with a status the step does not accept
    #[error("{step}: expected status {expected}, was {status}, {body}; device {device_id}")]
    UnexpectedStatus {
        /// Lifecycle step that issued the request
        step: &'static str,
        /// Device that issued the request
        device_id: String,
        /// Status code the step requires
        expected: u16,
        /// Status code the server returned
        status: u16,
        /// Response body, kept for diagnosis
        body: String,
    },

    /// Registration kept returning 404 past the configured bound
    #[error("register: max retries reached after {attempts} attempts; device {device_id}")]
    RetryBoundExceeded {
        /// Device that gave up
        device_id: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Approval was capped and never returned 200
    #[error("approve: no approval after {attempts} attempts; device {device_id}")]
    ApprovalNotGranted {
        /// Device that gave up
        device_id: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// A step ran without its prerequisite step succeeding
    #[error("{step}: prerequisite not met; device {device_id}")]
    PreconditionFailed {
        /// Step whose prerequisite was missing
        step: &'static str,
        /// Device the step belongs to
        device_id: String,
    },

    /// A lifecycle phase transition went anywhere but forward
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase
        from: Phase,
        /// Requested phase
        to: Phase,
    },

    /// Key, CSR, or certificate material could not be produced or stored
    #[error("identity error: {0}")]
    Identity(String),

    /// HTTP transport failure (connect, TLS, timeout, body read)
    #[error("http error: {0}")]
    Http(String),

    /// Certificate authority or certificate parsing failure
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled while the device was waiting
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Create an identity error with the given message
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Create an HTTP transport error with the given message
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unexpected status error from a server response
    pub fn unexpected_status(
        step: &'static str,
        device_id: &str,
        expected: u16,
        response: &ApiResponse,
    ) -> Self {
        Self::UnexpectedStatus {
            step,
            device_id: device_id.to_string(),
            expected,
            status: response.status,
            body: response.body.clone(),
        }
    }

    /// Create a precondition error for a step
    pub fn precondition(step: &'static str, device_id: &str) -> Self {
        Self::PreconditionFailed {
            step,
            device_id: device_id.to_string(),
        }
    }

    /// HTTP status attached to this error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
