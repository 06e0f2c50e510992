//! # Brass
//!
//! A pluggable runtime for chat bots that speak several protocols at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  events  ┌────────────┐  snapshot  ┌──────────────────┐
//! │ Adapter A │────────▶│            │◀──────────│  PluginRegistry  │◀── reload
//! ├───────────┤         │ Dispatcher │            └──────────────────┘
//! │ Adapter B │────────▶│            │──▶ plugin (priority 0) ──▶ plugin (10) ──▶ ...
//! └───────────┘         └────────────┘          │
//!       ▲                                        │ cx.reply(..) / cx.caller()
//!       └────────────── outbound actions ◀───────┘
//! ```
//!
//! - **Adapters** own one protocol connection each and emit normalized events
//! - **Plugins** are predicate + handler units, ordered by priority; a
//!   blocking plugin that handles an event stops the lower-priority ones
//! - **State** is scoped per event and per conversation; dispatches of one
//!   conversation never overlap
//! - **Reload** swaps the whole plugin set atomically
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use brass::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = BrassRuntime::new();
//!     runtime.register_adapter::<ConsoleAdapter>().await?;
//!
//!     runtime.register_plugin(on_command("echo").block(true).handler(|cx| async move {
//!         let text = strip_command(cx.event().plain_text(), "echo").unwrap_or_default();
//!         cx.reply(text).await?;
//!         Ok(Outcome::Handled)
//!     }))?;
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `console` *(default)*: the console reference adapter
//! - `toml-config` *(default)* / `yaml-config`: configuration file formats
//! - `json-log`: JSON log lines

pub use brass_core as core;
pub use brass_framework as framework;
pub use brass_runtime as runtime;

#[cfg(feature = "console")]
pub use brass_adapter_console as console;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use brass::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use brass_runtime::{
        BrassConfig, BrassRuntime, HookContext, PluginSource, ReloadHandle, RuntimeError,
        RuntimeResult,
    };

    // Plugin authoring
    pub use brass_framework::{
        HandlerContext, Outcome, Plugin, PluginDescriptor, StateHandle, on_command, on_event,
        on_event_name, on_message, on_meta, on_notice, on_request, strip_command,
    };

    // Events and outbound calls
    pub use brass_core::{
        Action, AdapterId, ApiError, ConversationId, Event, EventKind, OutboundCaller,
    };

    // Adapter authoring
    pub use brass_core::{
        Adapter, AdapterContext, AdapterError, AdapterResult, AdapterState, ApiResult,
        ConfigurableAdapter, async_trait,
    };

    #[cfg(feature = "console")]
    pub use brass_adapter_console::ConsoleAdapter;

    // Logging macros
    pub use brass_runtime::prelude::*;
}
