//! Event system for the Brass runtime.
//!
//! This module provides the normalized event value every adapter produces and
//! every plugin consumes:
//!
//! - [`EventKind`] - High-level classification (message, notice, request, meta)
//! - [`Event`] - Immutable, cheaply cloneable event value
//! - [`EventBuilder`] - Used by adapters to construct events
//! - [`AdapterId`] / [`ConversationId`] - Identifiers carried by events
//!
//! # Immutability
//!
//! An [`Event`] is an `Arc` around frozen data. Cloning shares the data, and
//! there is no API to mutate an event once built, so the dispatcher and plugins
//! can hold on to it for as long as they need without any reference back into
//! adapter-internal resources.
//!
//! ```rust,ignore
//! use brass_core::{Event, EventKind};
//!
//! let event = Event::builder("console", EventKind::Message)
//!     .name("message.private")
//!     .conversation("user:42")
//!     .text("/echo hello")
//!     .build();
//!
//! assert_eq!(event.plain_text(), "/echo hello");
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of one adapter instance registered with the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterId(Arc<str>);

impl AdapterId {
    /// Creates a new adapter identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdapterId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AdapterId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl AsRef<str> for AdapterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a conversation (chat, channel, private session, ...).
///
/// Events carrying the same conversation id share conversation-scoped state,
/// and their dispatches are serialized with respect to that state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Arc<str>);

impl ConversationId {
    /// Creates a new conversation identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

// ============================================================================
// Event Kind Classification
// ============================================================================

/// Classification of event types.
///
/// This enum represents the high-level category of an event, which is useful
/// for filtering events in predicates without knowing protocol details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Message events (private messages, group messages, etc.)
    Message,
    /// Notice events (group changes, recalls, friend adds, etc.)
    Notice,
    /// Request events (friend requests, group join requests, etc.)
    Request,
    /// Meta events (lifecycle, heartbeat, etc.)
    Meta,
    /// Other/unknown event types
    Other,
}

impl EventKind {
    /// Returns the lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Notice => "notice",
            Self::Request => "request",
            Self::Meta => "meta",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "message" => EventKind::Message,
            "notice" => EventKind::Notice,
            "request" => EventKind::Request,
            "meta" | "meta_event" => EventKind::Meta,
            _ => EventKind::Other,
        })
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct EventData {
    id: Uuid,
    kind: EventKind,
    name: String,
    adapter: AdapterId,
    timestamp: DateTime<Utc>,
    conversation: Option<ConversationId>,
    text: Option<String>,
    payload: Value,
}

/// An immutable, normalized event produced by an adapter.
///
/// `Event` is a thin `Arc` wrapper: cloning is cheap and every clone observes
/// the same data. Use [`Event::builder`] to construct one.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventData>,
}

impl Event {
    /// Starts building an event emitted by `adapter`.
    pub fn builder(adapter: impl Into<AdapterId>, kind: EventKind) -> EventBuilder {
        EventBuilder::new(adapter.into(), kind)
    }

    /// Unique identifier of this event.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// High-level classification.
    pub fn kind(&self) -> EventKind {
        self.inner.kind
    }

    /// Dotted event name, e.g. `message.group`. Defaults to the kind name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The adapter that produced this event.
    pub fn adapter_id(&self) -> &AdapterId {
        &self.inner.adapter
    }

    /// Time at which the adapter created the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.timestamp
    }

    /// The conversation this event belongs to, if the protocol has one.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.inner.conversation.as_ref()
    }

    /// Plain text of the event's message, or an empty string for events
    /// without text.
    pub fn plain_text(&self) -> &str {
        self.inner.text.as_deref().unwrap_or("")
    }

    /// Returns `true` if the adapter attached message text.
    pub fn has_text(&self) -> bool {
        self.inner.text.is_some()
    }

    /// Raw protocol-specific payload.
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Deserializes the payload into `T`.
    pub fn payload_as<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.inner.payload)
    }

    /// Returns `true` if both values refer to the same underlying event data.
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("adapter", &self.inner.adapter)
            .field("conversation", &self.inner.conversation)
            .finish()
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        EventData::deserialize(deserializer).map(|data| Event {
            inner: Arc::new(data),
        })
    }
}

// ============================================================================
// Event Builder
// ============================================================================

/// Builder for [`Event`] values.
///
/// The event id and timestamp are assigned automatically; adapters that know
/// the protocol-side timestamp can override it with [`timestamp`](Self::timestamp).
#[derive(Debug)]
pub struct EventBuilder {
    kind: EventKind,
    adapter: AdapterId,
    name: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    conversation: Option<ConversationId>,
    text: Option<String>,
    payload: Value,
}

impl EventBuilder {
    fn new(adapter: AdapterId, kind: EventKind) -> Self {
        Self {
            kind,
            adapter,
            name: None,
            timestamp: None,
            conversation: None,
            text: None,
            payload: Value::Null,
        }
    }

    /// Sets the dotted event name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the creation timestamp.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the conversation id used to scope shared state.
    pub fn conversation(mut self, id: impl Into<ConversationId>) -> Self {
        self.conversation = Some(id.into());
        self
    }

    /// Sets the plain text of the event's message.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the protocol-specific payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Freezes the builder into an immutable [`Event`].
    pub fn build(self) -> Event {
        let name = self
            .name
            .unwrap_or_else(|| self.kind.as_str().to_string());
        Event {
            inner: Arc::new(EventData {
                id: Uuid::new_v4(),
                kind: self.kind,
                name,
                adapter: self.adapter,
                timestamp: self.timestamp.unwrap_or_else(Utc::now),
                conversation: self.conversation,
                text: self.text,
                payload: self.payload,
            }),
        }
    }
}
