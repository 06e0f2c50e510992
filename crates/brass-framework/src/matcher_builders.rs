//! Closure-based plugin builders for common event types.
//!
//! These functions create a [`PluginBuilder`] pre-filtered to one kind of
//! event. Finish it with [`handler`](PluginBuilder::handler) to get a
//! [`PluginDescriptor`] ready for registration.
//!
//! # Example
//!
//! ```rust,ignore
//! use brass_framework::{on_command, on_message, on_notice, Outcome};
//!
//! registry.swap(vec![
//!     on_command("echo").block(true).handler(|cx| async move {
//!         let text = strip_command(cx.event().plain_text(), "echo").unwrap_or("");
//!         cx.reply(text).await?;
//!         Ok(Outcome::Handled)
//!     }),
//!     on_message().name("log").priority(100).handler(log_handler),
//!     on_notice().handler(notice_handler),
//! ])?;
//! ```
//!
//! Each builder gets a default name ("message", "command:echo", ...). Names
//! must be unique in a registry, so give repeated builders their own
//! [`name`](PluginBuilder::name).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brass_core::{Event, EventKind};

use crate::context::HandlerContext;
use crate::plugin::{DEFAULT_PRIORITY, Outcome, Plugin, PluginDescriptor};

type Rule = Arc<dyn Fn(&Event) -> anyhow::Result<bool> + Send + Sync>;

/// Builder for closure-based plugins.
#[derive(Clone)]
pub struct PluginBuilder {
    name: String,
    priority: i32,
    block: bool,
    timeout: Option<Duration>,
    rules: Vec<Rule>,
}

impl PluginBuilder {
    /// Creates a builder that matches every event.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            block: false,
            timeout: None,
            rules: Vec::new(),
        }
    }

    /// Sets the plugin name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
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

    /// Overrides the handler deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a rule. All rules must hold for the plugin to match.
    pub fn rule<F>(self, rule: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.try_rule(move |event| Ok(rule(event)))
    }

    /// Adds a fallible rule. An error is recorded as a predicate failure.
    pub fn try_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Finishes the builder with an async handler.
    pub fn handler<F, Fut>(self, handler: F) -> PluginDescriptor
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
    {
        let plugin = FnPlugin {
            rules: self.rules,
            handler,
        };
        let mut descriptor = PluginDescriptor::new(self.name, plugin)
            .priority(self.priority)
            .block(self.block);
        if let Some(timeout) = self.timeout {
            descriptor = descriptor.timeout(timeout);
        }
        descriptor
    }
}

struct FnPlugin<F> {
    rules: Vec<Rule>,
    handler: F,
}

#[async_trait]
impl<F, Fut> Plugin for FnPlugin<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    fn matches(&self, event: &Event) -> anyhow::Result<bool> {
        for rule in &self.rules {
            if !rule(event)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Outcome> {
        (self.handler)(cx).await
    }
}

/// Creates a builder that handles every event.
pub fn on_event() -> PluginBuilder {
    PluginBuilder::new("event")
}

/// Creates a builder that only handles events whose dotted name is `name` or
/// starts with `name.` (so `"message"` matches `"message.group"`).
pub fn on_event_name(name: impl Into<String>) -> PluginBuilder {
    let name = name.into();
    let prefix = format!("{name}.");
    PluginBuilder::new(format!("event:{name}"))
        .rule(move |event| event.name() == name || event.name().starts_with(&prefix))
}

/// Creates a builder that only handles message events.
pub fn on_message() -> PluginBuilder {
    on_kind(EventKind::Message)
}

/// Creates a builder that only handles notice events.
pub fn on_notice() -> PluginBuilder {
    on_kind(EventKind::Notice)
}

/// Creates a builder that only handles request events.
pub fn on_request() -> PluginBuilder {
    on_kind(EventKind::Request)
}

/// Creates a builder that only handles meta events.
pub fn on_meta() -> PluginBuilder {
    on_kind(EventKind::Meta)
}

fn on_kind(kind: EventKind) -> PluginBuilder {
    PluginBuilder::new(kind.as_str()).rule(move |event| event.kind() == kind)
}

/// Creates a builder for command messages.
///
/// This is a convenience function that automatically:
/// - Sets the plugin name to "command:<cmd>"
/// - Prepends "/" to the command if not present
/// - Filters for message events whose trimmed text is the command, or the
///   command followed by whitespace (case-insensitive)
pub fn on_command(cmd: impl Into<String>) -> PluginBuilder {
    let cmd = cmd.into();
    let bare = cmd.trim_start_matches('/').to_string();

    PluginBuilder::new(format!("command:{bare}")).rule(move |event| {
        event.kind() == EventKind::Message && strip_command(event.plain_text(), &bare).is_some()
    })
}

/// Returns the arguments after `/cmd` in `text`, or `None` if `text` is not
/// that command.
///
/// ```rust,ignore
/// assert_eq!(strip_command("/Echo  hi there", "echo"), Some("hi there"));
/// assert_eq!(strip_command("/echoes", "echo"), None);
/// ```
pub fn strip_command<'a>(text: &'a str, cmd: &str) -> Option<&'a str> {
    let cmd = cmd.trim_start_matches('/');
    let rest = text.trim().strip_prefix('/')?;
    let head = rest.get(..cmd.len())?;
    if !head.eq_ignore_ascii_case(cmd) {
        return None;
    }
    let tail = &rest[cmd.len()..];
    match tail.chars().next() {
        None => Some(""),
        Some(c) if c.is_whitespace() => Some(tail.trim_start()),
        Some(_) => None,
    }
}
