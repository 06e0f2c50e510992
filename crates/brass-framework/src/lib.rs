//! # Brass Framework
//!
//! Plugin authoring and the dispatch engine.
//!
//! - [`Plugin`] / [`PluginDescriptor`]: predicate + handler + priority + block
//! - [`on_message`], [`on_command`], ...: closure-based plugin builders
//! - [`PluginRegistry`]: copy-on-write plugin set with atomic swap
//! - [`StateStore`] / [`StateHandle`]: per-event and per-conversation state
//! - [`EventWaiters`]: "wait for the next event" support
//! - [`Dispatcher`]: routes one event through the matching plugins
//!
//! ## Example
//!
//! ```rust,ignore
//! use brass_framework::{on_command, strip_command, Dispatcher, Outcome, PluginRegistry};
//!
//! let registry = Arc::new(PluginRegistry::new());
//! registry.register(on_command("echo").block(true).handler(|cx| async move {
//!     let text = strip_command(cx.event().plain_text(), "echo").unwrap_or_default();
//!     cx.reply(text).await?;
//!     Ok(Outcome::Handled)
//! }))?;
//!
//! let dispatcher = Arc::new(Dispatcher::new(registry, router, DispatchConfig::default()));
//! let outcome = dispatcher.dispatch(event).await;
//! ```

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod matcher_builders;
pub mod plugin;
pub mod registry;
pub mod state;
pub mod waiter;

pub use context::{DispatchScope, HandlerContext};
pub use dispatcher::{
    DEFAULT_HANDLER_TIMEOUT, DispatchConfig, DispatchOutcome, DispatchStats, Dispatcher,
    Invocation,
};
pub use error::{PluginError, RegistryError, RegistryResult, StateError, StateResult};
pub use matcher_builders::{
    PluginBuilder, on_command, on_event, on_event_name, on_message, on_meta, on_notice,
    on_request, strip_command,
};
pub use plugin::{DEFAULT_PRIORITY, Outcome, Plugin, PluginDescriptor};
pub use registry::{PluginRegistry, RegistryEntry, RegistrySnapshot};
pub use state::{ConversationLease, StateHandle, StateStore};
pub use waiter::EventWaiters;
