//! # Brass Core
//!
//! The protocol-neutral foundation of the Brass bot runtime.
//!
//! This crate defines the values and contracts that sit between adapters and
//! the dispatch engine:
//!
//! - **Event Model**: immutable, reference-counted events ([`Event`], [`EventKind`])
//! - **Adapter Contract**: lifecycle and event intake ([`Adapter`], [`AdapterContext`], [`AdapterState`])
//! - **Outbound Path**: actions routed back to the originating adapter ([`Action`], [`OutboundCaller`], [`ActionRouter`])
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────────┐  emit   ┌────────────┐         ┌───────────┐
//! │   Adapter   │────────▶│ Dispatcher │────────▶│  Plugins  │
//! │  (console)  │         └────────────┘         └─────┬─────┘
//! └──────▲──────┘                                      │
//!        │        call_api     ┌────────────────┐      │
//!        └─────────────────────│ OutboundCaller │◀─────┘
//!                              └────────────────┘
//! ```
//!
//! The dispatcher itself lives in `brass-framework`; the orchestrator that wires
//! adapters to it lives in `brass-runtime`.

pub mod action;
pub mod adapter;
pub mod caller;
pub mod error;
pub mod event;

pub use action::Action;
pub use adapter::{Adapter, AdapterContext, AdapterState, BoxedAdapter, ConfigurableAdapter};
pub use caller::{ActionRouter, OutboundCaller};
pub use error::{AdapterError, AdapterResult, ApiError, ApiResult};
pub use event::{AdapterId, ConversationId, Event, EventBuilder, EventKind};

// Re-exported for adapter and plugin authors.
pub use async_trait::async_trait;
