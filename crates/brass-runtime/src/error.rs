//! Runtime error types.

use std::time::Duration;

use brass_core::AdapterError;
use brass_framework::RegistryError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Adapter configuration deserialization failed.
    #[error("Failed to deserialize adapter config: {0}")]
    AdapterConfigDeserialize(String),

    /// Adapter error.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// An adapter with this id is already registered.
    #[error("Adapter already registered: {0}")]
    DuplicateAdapter(String),

    /// No adapter with this id is registered.
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// Plugin registry rejected the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The reload loop is not running.
    #[error("Reload loop is not running")]
    ReloadClosed,

    /// `refresh` was requested but no plugin source is set.
    #[error("No plugin source configured")]
    NoPluginSource,

    /// The plugin source failed to produce a plugin set.
    #[error("Plugin source failed: {0}")]
    PluginSource(String),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No matching event arrived in time.
    #[error("No matching event within {0:?}")]
    WaitTimeout(Duration),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
