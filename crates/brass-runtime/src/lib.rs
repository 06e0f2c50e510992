//! Brass Runtime - orchestration layer for the Brass bot runtime.
//!
//! This crate provides:
//! - Runtime orchestration ([`BrassRuntime`])
//! - The adapter registry and outbound routing ([`AdapterRegistry`])
//! - Hot reload of the plugin set ([`ReloadHandle`], [`PluginSource`])
//! - Startup and shutdown hooks ([`LifecycleHooks`])
//! - Layered configuration and logging setup
//!
//! ```ignore
//! use brass_runtime::BrassRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = BrassRuntime::new();
//!     runtime.register_adapter::<ConsoleAdapter>().await?;
//!     runtime.register_plugins(plugins())?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod reload;
pub mod runtime;

// Re-exports
pub use adapters::{AdapterRegistry, AdapterSlot};
pub use config::{BrassConfig, ConfigError, ConfigLoader, ConfigResult, DispatchSettings};
pub use error::{RuntimeError, RuntimeResult};
pub use hooks::{HookContext, HookPhase, LifecycleHooks};
pub use logging::{LoggingBuilder, SpanEvents};
pub use reload::{PluginSource, ReloadHandle, ReloadRequest};
pub use runtime::{BrassRuntime, RuntimeBuilder, RuntimeStats};

// Re-export figment for building config overrides
pub use figment;

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
