//! Plugin trait and descriptor.
//!
//! A plugin is a predicate plus an async handler. The [`PluginDescriptor`]
//! wraps a plugin with the metadata the dispatcher orders and gates it by:
//! a unique name, a priority (lower runs first) and a block flag.
//!
//! ```rust,ignore
//! struct Greeter;
//!
//! #[async_trait]
//! impl Plugin for Greeter {
//!     fn matches(&self, event: &Event) -> anyhow::Result<bool> {
//!         Ok(event.plain_text() == "hello")
//!     }
//!
//!     async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Outcome> {
//!         cx.reply("hi!").await?;
//!         Ok(Outcome::Handled)
//!     }
//! }
//!
//! registry.register(PluginDescriptor::new("greeter", Greeter).priority(5).block(true))?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brass_core::Event;

use crate::context::HandlerContext;

/// Result of a successful handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The plugin looked at the event and chose not to act on it.
    Pass,
    /// The plugin handled the event. Stops the chain if the plugin blocks.
    Handled,
}

/// Application logic unit: a predicate plus an async handler.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Decides whether the handler should run for `event`.
    ///
    /// Errors (and panics) are isolated like handler errors: recorded, and
    /// the chain continues.
    fn matches(&self, _event: &Event) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Handles a matched event.
    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Outcome>;
}

/// Default priority of a descriptor.
pub const DEFAULT_PRIORITY: i32 = 0;

/// A named, prioritized plugin ready for registration.
///
/// Priority, block flag and timeout are fixed once the descriptor is
/// registered; changing them means deregistering and registering again.
#[derive(Clone)]
pub struct PluginDescriptor {
    name: Arc<str>,
    priority: i32,
    block: bool,
    timeout: Option<Duration>,
    plugin: Arc<dyn Plugin>,
}

impl PluginDescriptor {
    /// Creates a descriptor with default priority, non-blocking.
    pub fn new(name: impl AsRef<str>, plugin: impl Plugin + 'static) -> Self {
        Self::from_arc(name, Arc::new(plugin))
    }

    /// Creates a descriptor around an already shared plugin.
    pub fn from_arc(name: impl AsRef<str>, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            priority: DEFAULT_PRIORITY,
            block: false,
            timeout: None,
            plugin,
        }
    }

    /// Sets the priority. Lower values run first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets whether handling the event stops lower-priority plugins.
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Overrides the dispatcher's default handler deadline for this plugin.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The unique plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> &Arc<str> {
        &self.name
    }

    /// The priority.
    pub fn get_priority(&self) -> i32 {
        self.priority
    }

    /// Returns `true` if the plugin blocks after handling.
    pub fn is_blocking(&self) -> bool {
        self.block
    }

    /// The per-plugin deadline override, if any.
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The plugin implementation.
    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("block", &self.block)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
