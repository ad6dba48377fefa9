//! Error types for the call lifecycle registry
//!
//! Observers never see these: the registry absorbs anomalies and logs them.
//! Errors surface only at the edges, when a caller issues a command for a call
//! that no longer exists, when the telephony sink has gone away, or when
//! configuration cannot be loaded.

use std::fmt::Display;

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur in the call registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No entity with this id or handle is tracked
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: String },

    /// The telephony command sink was dropped
    #[error("Telephony service unavailable for {call_id}")]
    TelephonyUnavailable { call_id: String },

    /// A command argument was rejected before reaching telephony
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The call is in a state where the operation makes no sense
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// A metadata blob failed the key-presence probe or could not be decoded
    #[error("Malformed call metadata: {reason}")]
    MalformedMetadata { reason: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The owner task is gone
    #[error("Registry channel closed")]
    ChannelClosed,

    /// I/O error while reading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Create a call-not-found error
    pub fn call_not_found(call_id: impl Display) -> Self {
        Self::CallNotFound {
            call_id: call_id.to_string(),
        }
    }

    /// Create a telephony-unavailable error
    pub fn telephony_unavailable(call_id: impl Display) -> Self {
        Self::TelephonyUnavailable {
            call_id: call_id.to_string(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a malformed metadata error
    pub fn malformed_metadata(reason: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TelephonyUnavailable { .. } | Self::ChannelClosed
        )
    }
}
