//! Error types for access-manager operations.

use thiserror::Error;

/// Result type alias for access-manager operations.
pub type Result<T> = std::result::Result<T, AccessError>;

/// Errors that can occur while submitting or awaiting requests.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Unrecoverable local error (driver unavailable, worker died).
    #[error("fatal: {reason}")]
    Fatal {
        /// What went wrong.
        reason: String,
    },

    /// Malformed request (zero length, mismatched mask/data size, ...).
    #[error("invalid parameters: {reason}")]
    InvalidParameters {
        /// What was malformed.
        reason: String,
    },

    /// The transport reported a failure for this request.
    #[error("device error: {reason}")]
    DeviceError {
        /// Reason reported by the transport.
        reason: String,
    },

    /// No reply arrived within the request's deadline.
    #[error("operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The transport explicitly signalled that no response exists.
    ///
    /// Distinct from [`AccessError::Timeout`], which is a silent expiry.
    #[error("no answer for request {id}")]
    NoAnswer {
        /// Correlation id of the unanswered request.
        id: u32,
    },

    /// A request was submitted before `open` (or after `close`).
    #[error("access manager not initialized")]
    NotInitialized,

    /// The request kind is not valid for the configured strategy.
    #[error("unsupported: {what}")]
    Unsupported {
        /// Which operation / mode combination is unsupported.
        what: String,
    },

    /// Behaviour accepted by the configuration surface but not built.
    #[error("not implemented: {what}")]
    NotImplemented {
        /// What is missing.
        what: String,
    },
}

impl AccessError {
    /// Create a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Create a device error.
    pub fn device_error(reason: impl Into<String>) -> Self {
        Self::DeviceError {
            reason: reason.into(),
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented { what: what.into() }
    }
}
