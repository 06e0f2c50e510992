//! Error types for the Brass framework.

use std::time::Duration;

use thiserror::Error;

/// A failed plugin invocation.
///
/// These never propagate out of a dispatch: the dispatcher records them in the
/// [`DispatchOutcome`](crate::DispatchOutcome), logs them and moves on to the
/// next plugin.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// The handler returned an error.
    #[error("plugin '{plugin}' failed: {message}")]
    Failed {
        /// Plugin name.
        plugin: String,
        /// Rendered error chain.
        message: String,
    },

    /// The handler exceeded its deadline and was cancelled.
    #[error("plugin '{plugin}' timed out after {timeout:?}")]
    Timeout {
        /// Plugin name.
        plugin: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The handler panicked.
    #[error("plugin '{plugin}' panicked: {message}")]
    Panicked {
        /// Plugin name.
        plugin: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The predicate returned an error or panicked.
    #[error("predicate of plugin '{plugin}' failed: {message}")]
    PredicateFailed {
        /// Plugin name.
        plugin: String,
        /// Rendered error or panic message.
        message: String,
    },
}

impl PluginError {
    /// Name of the plugin that produced the error.
    pub fn plugin(&self) -> &str {
        match self {
            Self::Failed { plugin, .. }
            | Self::Timeout { plugin, .. }
            | Self::Panicked { plugin, .. }
            | Self::PredicateFailed { plugin, .. } => plugin,
        }
    }
}

/// Errors returned by [`PluginRegistry`](crate::PluginRegistry) mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A plugin with this name is already registered (or appears twice in a
    /// swapped-in set).
    #[error("plugin '{name}' is already registered")]
    DuplicateName {
        /// The duplicate name.
        name: String,
    },

    /// No plugin with this name is registered.
    #[error("plugin '{name}' not found")]
    NotFound {
        /// The missing name.
        name: String,
    },
}

/// Errors returned by [`StateHandle`](crate::StateHandle) operations.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// The conversation lease this handle belonged to has been released.
    #[error("state scope has been released")]
    ScopeReleased,

    /// A value could not be converted to or from JSON.
    #[error("state serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
