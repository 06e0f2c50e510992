//! Registry of adapter instances and their lifecycle state.
//!
//! The map is copy-on-write: readers clone an `Arc` to the current map and
//! never hold the lock across an `await`, so adapters can be added or removed
//! while outbound calls are in flight.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use brass_core::{
    Action, ActionRouter, AdapterId, AdapterState, ApiError, ApiResult, BoxedAdapter,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{RuntimeError, RuntimeResult};

/// One registered adapter and the runtime's bookkeeping for it.
pub struct AdapterSlot {
    id: AdapterId,
    adapter: BoxedAdapter,
    state: Arc<watch::Sender<AdapterState>>,
    shutdown: Mutex<CancellationToken>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterSlot {
    fn new(id: AdapterId, adapter: BoxedAdapter) -> Self {
        let (state, _) = watch::channel(AdapterState::Stopped);
        Self {
            id,
            adapter,
            state: Arc::new(state),
            shutdown: Mutex::new(CancellationToken::new()),
            pump: Mutex::new(None),
        }
    }

    /// The id this adapter is registered under.
    pub fn id(&self) -> &AdapterId {
        &self.id
    }

    /// The adapter instance.
    pub fn adapter(&self) -> &BoxedAdapter {
        &self.adapter
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    pub(crate) fn state_sender(&self) -> Arc<watch::Sender<AdapterState>> {
        Arc::clone(&self.state)
    }

    pub(crate) fn set_state(&self, state: AdapterState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(adapter = %self.id, from = %previous, to = %state, "adapter state changed");
        }
    }

    /// Moves `Starting` to `Running`. Leaves any other state reported by the
    /// adapter during `start` untouched.
    pub(crate) fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == AdapterState::Starting {
                *state = AdapterState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Installs a fresh shutdown token for a new start cycle.
    pub(crate) fn renew_shutdown(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();
        token
    }

    pub(crate) fn cancel(&self) {
        self.shutdown.lock().cancel();
    }

    pub(crate) fn set_pump(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump.lock().take()
    }
}

impl std::fmt::Debug for AdapterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSlot")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Copy-on-write map of adapter id to slot.
#[derive(Default)]
pub struct AdapterRegistry {
    slots: RwLock<Arc<HashMap<AdapterId, Arc<AdapterSlot>>>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter in the `Stopped` state.
    pub fn insert(&self, id: AdapterId, adapter: BoxedAdapter) -> RuntimeResult<Arc<AdapterSlot>> {
        let mut slots = self.slots.write();
        if slots.contains_key(&id) {
            return Err(RuntimeError::DuplicateAdapter(id.to_string()));
        }
        let slot = Arc::new(AdapterSlot::new(id.clone(), adapter));
        let mut next = HashMap::clone(&slots);
        next.insert(id, Arc::clone(&slot));
        *slots = Arc::new(next);
        Ok(slot)
    }

    /// Removes an adapter. Outbound calls to it fail from now on.
    pub fn remove(&self, id: &AdapterId) -> Option<Arc<AdapterSlot>> {
        let mut slots = self.slots.write();
        if !slots.contains_key(id) {
            return None;
        }
        let mut next = HashMap::clone(&slots);
        let removed = next.remove(id);
        *slots = Arc::new(next);
        removed
    }

    /// Looks up one adapter.
    pub fn get(&self, id: &AdapterId) -> Option<Arc<AdapterSlot>> {
        self.slots.read().get(id).cloned()
    }

    /// State of one adapter, `None` if unknown.
    pub fn state(&self, id: &AdapterId) -> Option<AdapterState> {
        self.get(id).map(|slot| slot.state())
    }

    /// All slots, ordered by id.
    pub fn slots(&self) -> Vec<Arc<AdapterSlot>> {
        let current = Arc::clone(&self.slots.read());
        let mut slots: Vec<_> = current.values().cloned().collect();
        slots.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        slots
    }

    /// Registered ids with their states, ordered by id.
    pub fn list(&self) -> Vec<(AdapterId, AdapterState)> {
        self.slots()
            .into_iter()
            .map(|slot| (slot.id.clone(), slot.state()))
            .collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[async_trait]
impl ActionRouter for AdapterRegistry {
    async fn route(&self, adapter: &AdapterId, action: Action) -> ApiResult<Value> {
        let Some(slot) = self.get(adapter) else {
            return Err(ApiError::AdapterUnavailable {
                adapter: adapter.clone(),
            });
        };
        if !slot.state().accepts_calls() {
            trace!(adapter = %adapter, state = %slot.state(), action = %action.name, "rejecting call");
            return Err(ApiError::AdapterUnavailable {
                adapter: adapter.clone(),
            });
        }
        slot.adapter.call_api(action).await
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.list()).finish()
    }
}
