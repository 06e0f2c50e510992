//! Adapter contract.
//!
//! An adapter owns one protocol connection. It translates inbound traffic into
//! [`Event`]s, pushes them through the [`AdapterContext`] it receives on start,
//! and executes outbound [`Action`]s through [`Adapter::call_api`].
//!
//! # Lifecycle
//!
//! ```text
//!  starting ──▶ running ◀──▶ reconnecting
//!     │            │               │
//!     └────────────┴───▶ stopping ─┴──▶ stopped
//! ```
//!
//! The orchestrator drives `starting`, `running` (after a successful
//! [`start`](Adapter::start)), `stopping` and `stopped`. The adapter itself
//! reports connection loss and recovery with [`AdapterContext::set_state`].
//! Outbound calls are only routed to adapters in the `running` state.
//!
//! # Example
//!
//! ```rust,ignore
//! #[async_trait]
//! impl Adapter for MyAdapter {
//!     async fn start(&self, ctx: AdapterContext) -> AdapterResult<()> {
//!         let conn = self.connect().await?;
//!         tokio::spawn(async move {
//!             while let Some(frame) = conn.next().await {
//!                 let event = ctx.event(EventKind::Message).text(frame.text).build();
//!                 if ctx.emit(event).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!         Ok(())
//!     }
//!
//!     async fn call_api(&self, action: Action) -> ApiResult<Value> {
//!         self.conn.request(action).await
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::Action;
use crate::error::{AdapterError, AdapterResult, ApiResult};
use crate::event::{AdapterId, Event, EventBuilder, EventKind};

// ============================================================================
// Adapter State
// ============================================================================

/// Lifecycle state of a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// `start` has been called and has not returned yet.
    Starting,
    /// The adapter is connected and accepts outbound calls.
    Running,
    /// The connection dropped; the adapter is trying to restore it.
    Reconnecting,
    /// `stop` has been called.
    Stopping,
    /// Terminal state. Also reached when `start` fails.
    Stopped,
}

impl AdapterState {
    /// Returns `true` if outbound calls may be routed to the adapter.
    pub fn accepts_calls(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Adapter Context
// ============================================================================

/// Handle given to an adapter on start.
///
/// Cloneable; adapters typically move a clone into their I/O task.
#[derive(Clone)]
pub struct AdapterContext {
    id: AdapterId,
    events: mpsc::Sender<Event>,
    state: Arc<watch::Sender<AdapterState>>,
    shutdown: CancellationToken,
}

impl AdapterContext {
    /// Creates a new adapter context.
    ///
    /// Called by the orchestrator; tests use it to drive adapters directly.
    pub fn new(
        id: AdapterId,
        events: mpsc::Sender<Event>,
        state: Arc<watch::Sender<AdapterState>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            events,
            state,
            shutdown,
        }
    }

    /// The id this adapter instance is registered under.
    pub fn adapter_id(&self) -> &AdapterId {
        &self.id
    }

    /// Starts building an event attributed to this adapter.
    pub fn event(&self, kind: EventKind) -> EventBuilder {
        Event::builder(self.id.clone(), kind)
    }

    /// Hands an event to the orchestrator.
    ///
    /// Waits for buffer space. Fails with [`AdapterError::ChannelClosed`] once
    /// the orchestrator has stopped intake.
    pub async fn emit(&self, event: Event) -> AdapterResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| AdapterError::ChannelClosed)
    }

    /// Non-blocking variant of [`emit`](Self::emit). Drops the event when the
    /// buffer is full.
    pub fn try_emit(&self, event: Event) -> AdapterResult<()> {
        self.events.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AdapterError::Internal("event buffer full".into())
            }
            mpsc::error::TrySendError::Closed(_) => AdapterError::ChannelClosed,
        })
    }

    /// Reports a state change, e.g. `Reconnecting` after a dropped connection
    /// and `Running` after recovery.
    pub fn set_state(&self, state: AdapterState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(adapter = %self.id, from = %previous, to = %state, "adapter state changed");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Token cancelled when the orchestrator stops this adapter.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns `true` once stop has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Adapter Trait
// ============================================================================

/// The core adapter trait.
///
/// Adapters bridge protocol-specific implementations with the runtime. They
/// are responsible for:
///
/// - Managing their connection (and reconnecting)
/// - Parsing raw traffic into events
/// - Executing outbound actions
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Called when the adapter should start.
    ///
    /// Long-running I/O belongs in a task spawned from here; the call itself
    /// should return once the adapter is ready to accept outbound calls.
    async fn start(&self, ctx: AdapterContext) -> AdapterResult<()>;

    /// Called when the adapter is shutting down.
    ///
    /// The context's shutdown token is already cancelled at this point.
    async fn stop(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Executes an outbound action.
    async fn call_api(&self, action: Action) -> ApiResult<Value>;
}

/// A shared adapter trait object.
pub type BoxedAdapter = Arc<dyn Adapter>;

/// Trait for adapters that can be created from configuration.
///
/// The runtime reads the `adapters.<name>` section, deserializes it into
/// [`Config`](Self::Config) (falling back to `Default` when absent) and
/// registers the adapter under `name`.
pub trait ConfigurableAdapter: Adapter + Sized + 'static {
    /// The configuration type for this adapter.
    type Config: serde::de::DeserializeOwned + Default;

    /// Returns the adapter name (e.g., "console").
    fn name() -> &'static str;

    /// Creates an adapter from its configuration.
    fn from_config(config: Self::Config) -> AdapterResult<Arc<Self>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (AdapterContext, mpsc::Receiver<Event>, watch::Receiver<AdapterState>) {
        let (tx, rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(AdapterState::Starting);
        let ctx = AdapterContext::new(
            AdapterId::new("test"),
            tx,
            Arc::new(state_tx),
            CancellationToken::new(),
        );
        (ctx, rx, state_rx)
    }

    #[tokio::test]
    async fn test_emit_attributes_adapter() {
        let (ctx, mut rx, _state) = context();
        ctx.emit(ctx.event(EventKind::Message).text("hi").build())
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.adapter_id().as_str(), "test");
        assert_eq!(event.plain_text(), "hi");
    }

    #[tokio::test]
    async fn test_emit_after_close() {
        let (ctx, rx, _state) = context();
        drop(rx);
        let err = ctx
            .emit(ctx.event(EventKind::Meta).build())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::ChannelClosed));
    }

    #[test]
    fn test_try_emit_full_buffer() {
        let (ctx, _rx, _state) = context();
        ctx.try_emit(ctx.event(EventKind::Meta).build()).unwrap();
        let err = ctx.try_emit(ctx.event(EventKind::Meta).build()).unwrap_err();
        assert!(matches!(err, AdapterError::Internal(_)));
    }

    #[test]
    fn test_set_state_is_observed() {
        let (ctx, _rx, state) = context();
        ctx.set_state(AdapterState::Reconnecting);
        assert_eq!(*state.borrow(), AdapterState::Reconnecting);
        assert!(!ctx.state().accepts_calls());

        ctx.set_state(AdapterState::Running);
        assert!(ctx.state().accepts_calls());
    }
}
