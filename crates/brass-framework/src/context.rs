//! The context handed to plugin handlers.
//!
//! A [`HandlerContext`] composes two parts:
//!
//! - a **shared** [`DispatchScope`], created once per dispatch and shared by
//!   every plugin in the chain: the event, the per-event state scope, the
//!   conversation scope (if leased), the outbound caller and the event waiters;
//! - **plugin-specific** data: the plugin's name and its `plugins.<name>`
//!   configuration section.
//!
//! The context is owned and cheap to clone, so handlers can move it into
//! `async move` blocks freely.

use std::sync::Arc;
use std::time::Duration;

use brass_core::{ApiError, ApiResult, Event, OutboundCaller};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::state::StateHandle;
use crate::waiter::EventWaiters;

/// Everything one dispatch shares between its plugins.
#[derive(Debug)]
pub struct DispatchScope {
    event: Event,
    state: StateHandle,
    conversation: Option<StateHandle>,
    caller: OutboundCaller,
    waiters: Arc<EventWaiters>,
}

impl DispatchScope {
    /// Bundles the per-dispatch capabilities.
    pub fn new(
        event: Event,
        state: StateHandle,
        conversation: Option<StateHandle>,
        caller: OutboundCaller,
        waiters: Arc<EventWaiters>,
    ) -> Self {
        Self {
            event,
            state,
            conversation,
            caller,
            waiters,
        }
    }
}

/// The context object passed to [`Plugin::handle`](crate::Plugin::handle).
#[derive(Debug, Clone)]
pub struct HandlerContext {
    scope: Arc<DispatchScope>,
    plugin: Arc<str>,
    config: Option<Arc<Value>>,
}

impl HandlerContext {
    /// Creates a context for one plugin invocation.
    pub fn new(scope: Arc<DispatchScope>, plugin: Arc<str>, config: Option<Arc<Value>>) -> Self {
        Self {
            scope,
            plugin,
            config,
        }
    }

    /// The event being dispatched.
    pub fn event(&self) -> &Event {
        &self.scope.event
    }

    /// Per-event state, shared with the other plugins of this dispatch.
    pub fn state(&self) -> &StateHandle {
        &self.scope.state
    }

    /// Conversation state, if the event has a conversation id.
    pub fn conversation_state(&self) -> Option<&StateHandle> {
        self.scope.conversation.as_ref()
    }

    /// Outbound caller bound to the event's adapter.
    pub fn caller(&self) -> &OutboundCaller {
        &self.scope.caller
    }

    /// Name of the plugin this context was created for.
    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// Deserializes this plugin's `plugins.<name>` config section.
    ///
    /// An absent section yields `T::default()`.
    pub fn config<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.config.as_deref() {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => T::deserialize(value),
        }
    }

    /// Replies into the event's conversation.
    pub async fn reply(&self, message: impl Into<String>) -> ApiResult<Value> {
        let conversation = self
            .event()
            .conversation_id()
            .ok_or(ApiError::MissingConversation)?;
        self.caller().send_message(conversation, message).await
    }

    /// Waits for the next event from the same adapter and conversation.
    ///
    /// The event is consumed: plugins never see it. Returns `None` on timeout.
    pub async fn next_event(&self, timeout: Duration) -> Option<Event> {
        let adapter = self.event().adapter_id().clone();
        let conversation = self.event().conversation_id().cloned();
        self.wait_for(
            move |e| e.adapter_id() == &adapter && e.conversation_id() == conversation.as_ref(),
            timeout,
        )
        .await
    }

    /// Waits for the next event matching `predicate`, from any adapter.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<Event>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.scope.waiters.wait_for(predicate, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use async_trait::async_trait;
    use brass_core::{Action, ActionRouter, AdapterId, EventKind};
    use serde::Deserialize;
    use serde_json::json;

    struct EchoRouter;

    #[async_trait]
    impl ActionRouter for EchoRouter {
        async fn route(&self, _adapter: &AdapterId, action: Action) -> ApiResult<Value> {
            Ok(action.params)
        }
    }

    fn context(event: Event, config: Option<Value>) -> HandlerContext {
        let store = StateStore::new();
        let scope = DispatchScope::new(
            event.clone(),
            store.acquire_event_scope(),
            None,
            OutboundCaller::new(event.adapter_id().clone(), Arc::new(EchoRouter)),
            Arc::new(EventWaiters::new()),
        );
        HandlerContext::new(Arc::new(scope), Arc::from("test"), config.map(Arc::new))
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct GreetConfig {
        greeting: String,
        times: u32,
    }

    #[test]
    fn test_config_defaults_when_absent() {
        let event = Event::builder("test", EventKind::Message).build();
        let cx = context(event, None);
        assert_eq!(cx.config::<GreetConfig>().unwrap(), GreetConfig::default());
    }

    #[test]
    fn test_config_section() {
        let event = Event::builder("test", EventKind::Message).build();
        let cx = context(event, Some(json!({"greeting": "hey"})));
        let cfg: GreetConfig = cx.config().unwrap();
        assert_eq!(cfg.greeting, "hey");
        assert_eq!(cfg.times, 0);
    }

    #[tokio::test]
    async fn test_reply_uses_conversation() {
        let event = Event::builder("test", EventKind::Message)
            .conversation("room")
            .build();
        let cx = context(event, None);
        let sent = cx.reply("hello").await.unwrap();
        assert_eq!(sent, json!({"conversation_id": "room", "message": "hello"}));
    }

    #[tokio::test]
    async fn test_reply_without_conversation() {
        let event = Event::builder("test", EventKind::Notice).build();
        let cx = context(event, None);
        assert!(matches!(
            cx.reply("hello").await,
            Err(ApiError::MissingConversation)
        ));
    }
}
