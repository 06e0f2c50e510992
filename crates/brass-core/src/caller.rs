//! The outbound path from plugins back to adapters.
//!
//! Plugins never hold adapter handles. They get an [`OutboundCaller`] bound to
//! the adapter that produced the event, and the caller routes each action
//! through an [`ActionRouter`] (the orchestrator's adapter registry). The
//! router decides at call time whether the adapter is still available, so a
//! caller captured before an adapter was removed fails cleanly with
//! [`ApiError::AdapterUnavailable`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::action::Action;
use crate::error::{ApiError, ApiResult};
use crate::event::{AdapterId, ConversationId};

/// Routes actions to adapters by id.
#[async_trait]
pub trait ActionRouter: Send + Sync {
    /// Delivers `action` to the adapter registered as `adapter`.
    async fn route(&self, adapter: &AdapterId, action: Action) -> ApiResult<Value>;
}

/// Outbound call handle bound to one adapter.
#[derive(Clone)]
pub struct OutboundCaller {
    adapter: AdapterId,
    router: Arc<dyn ActionRouter>,
}

impl OutboundCaller {
    /// Creates a caller that sends everything to `adapter`.
    pub fn new(adapter: AdapterId, router: Arc<dyn ActionRouter>) -> Self {
        Self { adapter, router }
    }

    /// The adapter this caller is bound to.
    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter
    }

    /// Sends a raw action.
    pub async fn call_api(&self, action: Action) -> ApiResult<Value> {
        self.router.route(&self.adapter, action).await
    }

    /// Calls an action with serializable parameters and deserializes the reply.
    pub async fn call<P, R>(&self, name: &str, params: P) -> ApiResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let action = Action::with_params(name, params)?;
        let value = self.call_api(action).await?;
        serde_json::from_value(value).map_err(ApiError::from)
    }

    /// Sends a text message into a conversation.
    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        message: impl Into<String>,
    ) -> ApiResult<Value> {
        let action = Action::new(Action::SEND_MESSAGE)
            .param("conversation_id", conversation.as_str())
            .param("message", message.into());
        self.call_api(action).await
    }
}

impl fmt::Debug for OutboundCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCaller")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingRouter {
        calls: Mutex<Vec<(AdapterId, Action)>>,
    }

    #[async_trait]
    impl ActionRouter for RecordingRouter {
        async fn route(&self, adapter: &AdapterId, action: Action) -> ApiResult<Value> {
            if adapter.as_str() == "gone" {
                return Err(ApiError::AdapterUnavailable {
                    adapter: adapter.clone(),
                });
            }
            self.calls.lock().push((adapter.clone(), action));
            Ok(json!({"message_id": 1}))
        }
    }

    #[tokio::test]
    async fn test_send_message_routes_to_bound_adapter() {
        let router = Arc::new(RecordingRouter::default());
        let caller = OutboundCaller::new(AdapterId::new("console"), router.clone());

        caller
            .send_message(&ConversationId::new("room"), "pong")
            .await
            .unwrap();

        let calls = router.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "console");
        assert_eq!(calls[0].1.name, Action::SEND_MESSAGE);
        assert_eq!(calls[0].1.params["message"], "pong");
        assert_eq!(calls[0].1.params["conversation_id"], "room");
    }

    #[tokio::test]
    async fn test_typed_call() {
        #[derive(serde::Deserialize)]
        struct Reply {
            message_id: i64,
        }

        let caller = OutboundCaller::new(
            AdapterId::new("console"),
            Arc::new(RecordingRouter::default()),
        );
        let reply: Reply = caller.call("get_status", json!({})).await.unwrap();
        assert_eq!(reply.message_id, 1);
    }

    #[tokio::test]
    async fn test_unavailable_adapter() {
        let caller = OutboundCaller::new(
            AdapterId::new("gone"),
            Arc::new(RecordingRouter::default()),
        );
        let err = caller.call_api(Action::new("noop")).await.unwrap_err();
        assert!(matches!(err, ApiError::AdapterUnavailable { .. }));
    }
}
