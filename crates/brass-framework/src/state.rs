//! Shared state store.
//!
//! Plugins share state through [`StateHandle`]s onto key → JSON value maps.
//! There are two scopes:
//!
//! - **Event scope**: created at dispatch start, shared by every plugin in that
//!   dispatch, discarded when the dispatch completes.
//! - **Conversation scope**: keyed by [`ConversationId`], persists across
//!   events. A dispatch holds it through a [`ConversationLease`]; only one
//!   lease per conversation exists at a time, and acquiring waits (FIFO) for
//!   the current holder to drop it.
//!
//! A conversation [`StateHandle`] that outlives its lease stops working: reads
//! return nothing and writes fail with [`StateError::ScopeReleased`].
//!
//! A conversation whose state is empty when its last lease is released, with
//! nobody waiting for it, is dropped from the store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use brass_core::ConversationId;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{StateError, StateResult};

type Values = HashMap<String, Value>;

// ============================================================================
// StateHandle
// ============================================================================

/// Handle onto one state scope.
///
/// Cloning shares the scope.
#[derive(Clone, Debug)]
pub struct StateHandle {
    values: Arc<Mutex<Values>>,
    released: Option<Arc<AtomicBool>>,
}

impl StateHandle {
    fn detached(values: Arc<Mutex<Values>>) -> Self {
        Self {
            values,
            released: None,
        }
    }

    fn leased(values: Arc<Mutex<Values>>, released: Arc<AtomicBool>) -> Self {
        Self {
            values,
            released: Some(released),
        }
    }

    /// Returns `true` if the lease backing this handle has been released.
    pub fn is_released(&self) -> bool {
        self.released
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn read<R>(&self, f: impl FnOnce(&Values) -> R) -> Option<R> {
        let values = self.values.lock();
        if self.is_released() {
            return None;
        }
        Some(f(&values))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Values) -> R) -> StateResult<R> {
        let mut values = self.values.lock();
        if self.is_released() {
            return Err(StateError::ScopeReleased);
        }
        Ok(f(&mut values))
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read(|values| values.get(key).cloned()).flatten()
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> StateResult<Option<Value>> {
        let key = key.into();
        let value = value.into();
        self.write(|values| values.insert(key, value))
    }

    /// Removes `key`, returning its value.
    pub fn delete(&self, key: &str) -> StateResult<Option<Value>> {
        self.write(|values| values.remove(key))
    }

    /// Reads `key` and deserializes it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serializes `value` and stores it under `key`.
    pub fn set_as<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> StateResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).map(|_| ())
    }

    /// Atomically replaces the value under `key` with `f(current)`.
    pub fn update<F>(&self, key: impl Into<String>, f: F) -> StateResult<Value>
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let key = key.into();
        self.write(|values| {
            let next = f(values.get(&key));
            values.insert(key, next.clone());
            next
        })
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .read(|values| values.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.read(|values| values.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// ConversationLease
// ============================================================================

/// Exclusive hold on one conversation scope.
///
/// Released when dropped, including when the owning dispatch errors, times
/// out or is cancelled.
pub struct ConversationLease {
    id: ConversationId,
    handle: StateHandle,
    released: Arc<AtomicBool>,
    slot: Arc<ConversationSlot>,
    store: Weak<Conversations>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationLease {
    /// The leased conversation.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.id
    }

    /// A handle onto the conversation's state, valid while the lease lives.
    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        // Lock order is store, then values. Holding the store lock keeps new
        // acquirers from picking up the slot while it is checked for eviction.
        let store = self.store.upgrade();
        let mut conversations = store.as_ref().map(|store| store.lock());

        {
            // Flip under the values lock so no handle write straddles the release.
            let _values = self.handle.values.lock();
            self.released.store(true, Ordering::Release);
        }
        self.guard.take();
        trace!(conversation = %self.id, "conversation lease released");

        let Some(conversations) = conversations.as_mut() else {
            return;
        };
        let current = conversations
            .get(&self.id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot));
        // Map entry plus this lease; anyone else holding the slot is waiting.
        let idle = Arc::strong_count(&self.slot) == 2 && Arc::strong_count(&self.slot.lock) == 1;
        if current && idle && self.slot.values.lock().is_empty() {
            conversations.remove(&self.id);
            trace!(conversation = %self.id, "empty conversation scope dropped");
        }
    }
}

impl std::fmt::Debug for ConversationLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLease")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// StateStore
// ============================================================================

struct ConversationSlot {
    lock: Arc<AsyncMutex<()>>,
    values: Arc<Mutex<Values>>,
}

type Conversations = Mutex<HashMap<ConversationId, Arc<ConversationSlot>>>;

/// Owner of all conversation scopes.
#[derive(Default)]
pub struct StateStore {
    conversations: Arc<Conversations>,
}

impl StateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh per-event scope.
    pub fn acquire_event_scope(&self) -> StateHandle {
        StateHandle::detached(Arc::new(Mutex::new(Values::new())))
    }

    fn slot(&self, id: &ConversationId) -> Arc<ConversationSlot> {
        let mut conversations = self.conversations.lock();
        Arc::clone(conversations.entry(id.clone()).or_insert_with(|| {
            Arc::new(ConversationSlot {
                lock: Arc::new(AsyncMutex::new(())),
                values: Arc::new(Mutex::new(Values::new())),
            })
        }))
    }

    /// Acquires the conversation scope for `id`, waiting while another
    /// dispatch holds it.
    ///
    /// Dropping the returned future abandons the wait.
    pub async fn acquire_conversation_scope(&self, id: &ConversationId) -> ConversationLease {
        let slot = self.slot(id);
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        self.lease(id, slot, guard)
    }

    /// Acquires the conversation scope only if it is free right now.
    pub fn try_acquire_conversation_scope(&self, id: &ConversationId) -> Option<ConversationLease> {
        let slot = self.slot(id);
        let guard = Arc::clone(&slot.lock).try_lock_owned().ok()?;
        Some(self.lease(id, slot, guard))
    }

    fn lease(
        &self,
        id: &ConversationId,
        slot: Arc<ConversationSlot>,
        guard: OwnedMutexGuard<()>,
    ) -> ConversationLease {
        let released = Arc::new(AtomicBool::new(false));
        ConversationLease {
            id: id.clone(),
            handle: StateHandle::leased(Arc::clone(&slot.values), Arc::clone(&released)),
            released,
            slot,
            store: Arc::downgrade(&self.conversations),
            guard: Some(guard),
        }
    }

    /// Clears a conversation's state. The slot itself is dropped when no
    /// dispatch holds or waits for it. Returns `false` for unknown ids.
    pub fn clear_conversation(&self, id: &ConversationId) -> bool {
        let mut conversations = self.conversations.lock();
        let Some(slot) = conversations.get(id) else {
            return false;
        };
        slot.values.lock().clear();

        let idle = Arc::strong_count(slot) == 1 && Arc::strong_count(&slot.lock) == 1;
        if idle {
            conversations.remove(id);
        }
        true
    }

    /// Number of conversations with a live scope.
    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().len()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("conversations", &self.conversation_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_event_scope_basic_ops() {
        let store = StateStore::new();
        let state = store.acquire_event_scope();

        assert_ok!(state.set("b", 2));
        assert_ok!(state.set("a", "one"));
        assert_eq!(state.get("a"), Some(json!("one")));
        assert_eq!(state.keys(), vec!["a", "b"]);
        assert_eq!(state.len(), 2);

        assert_eq!(assert_ok!(state.delete("a")), Some(json!("one")));
        assert_eq!(state.get("a"), None);
        assert!(!state.is_released());
    }

    #[test]
    fn test_event_scopes_are_independent() {
        let store = StateStore::new();
        let first = store.acquire_event_scope();
        let second = store.acquire_event_scope();

        assert_ok!(first.set("k", true));
        assert!(second.get("k").is_none());
    }

    #[test]
    fn test_typed_access() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Session {
            step: u32,
            answers: Vec<String>,
        }

        let store = StateStore::new();
        let state = store.acquire_event_scope();
        let session = Session {
            step: 2,
            answers: vec!["yes".into()],
        };

        assert_ok!(state.set_as("session", &session));
        assert_eq!(assert_ok!(state.get_as::<Session>("session")), Some(session));

        assert_ok!(state.set("session", "not a session"));
        assert!(matches!(
            state.get_as::<Session>("session"),
            Err(StateError::Serialization(_))
        ));
    }

    #[test]
    fn test_update() {
        let store = StateStore::new();
        let state = store.acquire_event_scope();
        for _ in 0..3 {
            assert_ok!(state.update("count", |v| {
                json!(v.and_then(Value::as_i64).unwrap_or(0) + 1)
            }));
        }
        assert_eq!(state.get("count"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_conversation_state_persists_across_leases() {
        let store = StateStore::new();
        let id = ConversationId::new("c1");

        {
            let lease = store.acquire_conversation_scope(&id).await;
            assert_ok!(lease.handle().set("visits", 1));
        }

        let lease = store.acquire_conversation_scope(&id).await;
        assert_eq!(lease.handle().get("visits"), Some(json!(1)));
        assert_eq!(store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_outliving_lease_is_rejected() {
        let store = StateStore::new();
        let id = ConversationId::new("c1");

        let lease = store.acquire_conversation_scope(&id).await;
        let handle = lease.handle();
        assert_ok!(handle.set("k", 1));
        drop(lease);

        assert!(handle.is_released());
        assert!(handle.get("k").is_none());
        assert!(handle.keys().is_empty());
        assert!(matches!(assert_err!(handle.set("k", 2)), StateError::ScopeReleased));

        // The data itself is untouched for the next holder.
        let lease = store.acquire_conversation_scope(&id).await;
        assert_eq!(lease.handle().get("k"), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_is_exclusive() {
        let store = Arc::new(StateStore::new());
        let id = ConversationId::new("c1");

        let lease = store.acquire_conversation_scope(&id).await;
        assert!(store.try_acquire_conversation_scope(&id).is_none());

        let waiting = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move { store.acquire_conversation_scope(&id).await.handle().len() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(lease);
        assert_eq!(waiting.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_conversations_are_dropped_on_release() {
        let store = StateStore::new();
        for n in 0..100 {
            let id = ConversationId::new(format!("quiet-{n}"));
            let lease = store.acquire_conversation_scope(&id).await;
            assert_eq!(store.conversation_count(), 1);
            drop(lease);
        }
        assert_eq!(store.conversation_count(), 0);

        let id = ConversationId::new("chatty");
        {
            let lease = store.acquire_conversation_scope(&id).await;
            assert_ok!(lease.handle().set("k", 1));
        }
        assert_eq!(store.conversation_count(), 1);

        {
            let lease = store.acquire_conversation_scope(&id).await;
            assert_ok!(lease.handle().delete("k"));
        }
        assert_eq!(store.conversation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_with_waiter_is_kept() {
        let store = Arc::new(StateStore::new());
        let id = ConversationId::new("c1");
        let lease = store.acquire_conversation_scope(&id).await;

        let waiting = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let lease = store.acquire_conversation_scope(&id).await;
                assert_ok!(lease.handle().set("after", true));
                store.conversation_count()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(lease);
        assert_eq!(waiting.await.unwrap(), 1);
        assert_eq!(store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn test_different_conversations_do_not_contend() {
        let store = StateStore::new();
        let _a = store.acquire_conversation_scope(&ConversationId::new("a")).await;
        let b = store.try_acquire_conversation_scope(&ConversationId::new("b"));
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_clear_conversation() {
        let store = StateStore::new();
        let id = ConversationId::new("c1");

        {
            let lease = store.acquire_conversation_scope(&id).await;
            assert_ok!(lease.handle().set("k", 1));
        }
        assert!(store.clear_conversation(&id));
        assert_eq!(store.conversation_count(), 0);
        assert!(!store.clear_conversation(&id));

        // A held scope is cleared but kept.
        let lease = store.acquire_conversation_scope(&id).await;
        assert_ok!(lease.handle().set("k", 1));
        assert!(store.clear_conversation(&id));
        assert!(lease.handle().is_empty());
        assert_eq!(store.conversation_count(), 1);
    }
}
