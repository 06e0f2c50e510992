//! Error types shared by adapters and the outbound call path.
//!
//! Dispatch-level errors (plugin failures, registry and state errors) are
//! defined in `brass-framework`; orchestrator errors live in `brass-runtime`.

use thiserror::Error;

use crate::event::AdapterId;

// =============================================================================
// Adapter Errors
// =============================================================================

/// Errors that can occur in adapter lifecycle operations.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The adapter could not be started.
    #[error("adapter failed to start: {0}")]
    StartFailed(String),

    /// The adapter could not be stopped cleanly.
    #[error("adapter failed to stop: {0}")]
    StopFailed(String),

    /// The adapter configuration section is invalid.
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),

    /// The event channel to the orchestrator is closed (intake stopped).
    #[error("event channel closed")]
    ChannelClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal adapter error.
    #[error("adapter error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// =============================================================================
// API Errors
// =============================================================================

/// Error type for outbound API calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The target adapter is not running (disconnected, stopping, stopped or
    /// removed).
    #[error("adapter '{adapter}' is not available")]
    AdapterUnavailable {
        /// The adapter the call was routed to.
        adapter: AdapterId,
    },
    /// The adapter does not implement the requested action.
    #[error("unsupported action '{action}'")]
    UnsupportedAction {
        /// Name of the rejected action.
        action: String,
    },
    /// The action parameters were missing or malformed.
    #[error("invalid parameters for '{action}': {reason}")]
    InvalidParams {
        /// Name of the action.
        action: String,
        /// What was wrong with the parameters.
        reason: String,
    },
    /// The event has no conversation to reply into.
    #[error("event has no conversation")]
    MissingConversation,
    /// The API call timed out.
    #[error("API call timed out")]
    Timeout,
    /// The adapter reported a failure.
    #[error("API call failed: {0}")]
    Failed(String),
    /// Failed to serialize/deserialize.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Result type for API calls.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_names_adapter() {
        let err = ApiError::AdapterUnavailable {
            adapter: AdapterId::new("onebot"),
        };
        assert_eq!(err.to_string(), "adapter 'onebot' is not available");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: AdapterError = io.into();
        assert!(matches!(err, AdapterError::Io(msg) if msg.contains("pipe closed")));
    }
}
