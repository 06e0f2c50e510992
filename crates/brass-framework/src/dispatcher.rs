//! Event dispatcher for the Brass framework.
//!
//! This module provides the [`Dispatcher`], which routes one event through the
//! ordered set of matching plugins. When an event is dispatched:
//!
//! 1. The event is offered to pending [event waiters](crate::EventWaiters);
//!    a claimed event goes no further
//! 2. A registry snapshot is taken; it is used for the whole dispatch
//! 3. A fresh event scope is created and, for events with a conversation id,
//!    the conversation lease is acquired (waiting for other dispatches of the
//!    same conversation)
//! 4. Enabled plugins are visited in `(priority, registration)` order; each
//!    matching plugin's handler runs under a deadline with panics caught
//! 5. A blocking plugin that returns [`Outcome::Handled`] stops the chain;
//!    errors never stop it
//! 6. The lease is released and a [`DispatchOutcome`] is returned
//!
//! The orchestrator uses [`Dispatcher::spawn`] so every event runs in its own
//! task while adapter I/O continues.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use brass_core::{ActionRouter, Event, OutboundCaller};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Level, debug, span, trace, warn};
use uuid::Uuid;

use crate::context::{DispatchScope, HandlerContext};
use crate::error::PluginError;
use crate::plugin::Outcome;
use crate::registry::{PluginRegistry, RegistryEntry};
use crate::state::StateStore;
use crate::waiter::EventWaiters;

/// Default handler deadline.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Deadline for one handler invocation, unless the plugin overrides it.
    pub handler_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// One plugin considered by a dispatch.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Plugin name.
    pub plugin: String,
    /// Plugin priority.
    pub priority: i32,
    /// What the handler returned, or why it failed.
    pub result: Result<Outcome, PluginError>,
    /// Time spent in the predicate and handler.
    pub elapsed: Duration,
}

impl Invocation {
    /// Returns `true` if the handler was entered (as opposed to a failed
    /// predicate).
    pub fn handler_ran(&self) -> bool {
        !matches!(self.result, Err(PluginError::PredicateFailed { .. }))
    }
}

/// Report of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Id of the dispatched event.
    pub event_id: Uuid,
    /// Generation of the registry snapshot the dispatch used. `None` if the
    /// event was claimed or cancelled before a snapshot was taken.
    pub generation: Option<u64>,
    /// Plugins considered, in execution order.
    pub invocations: Vec<Invocation>,
    /// The blocking plugin that stopped the chain, if any.
    pub blocked_by: Option<String>,
    /// `true` if an event waiter consumed the event.
    pub claimed: bool,
    /// `true` if the dispatch was cancelled before finishing.
    pub cancelled: bool,
    /// Wall time of the whole dispatch.
    pub elapsed: Duration,
}

impl DispatchOutcome {
    fn new(event_id: Uuid) -> Self {
        Self {
            event_id,
            generation: None,
            invocations: Vec::new(),
            blocked_by: None,
            claimed: false,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Names of plugins whose handler ran, in order.
    pub fn ran(&self) -> Vec<&str> {
        self.invocations
            .iter()
            .filter(|i| i.handler_ran())
            .map(|i| i.plugin.as_str())
            .collect()
    }

    /// All recorded plugin errors.
    pub fn errors(&self) -> impl Iterator<Item = &PluginError> {
        self.invocations.iter().filter_map(|i| i.result.as_ref().err())
    }

    /// Returns `true` if any plugin returned [`Outcome::Handled`].
    pub fn handled(&self) -> bool {
        self.invocations
            .iter()
            .any(|i| matches!(i.result, Ok(Outcome::Handled)))
    }

    /// The result recorded for `plugin`, if it was considered.
    pub fn result_of(&self, plugin: &str) -> Option<&Result<Outcome, PluginError>> {
        self.invocations
            .iter()
            .find(|i| i.plugin == plugin)
            .map(|i| &i.result)
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    claimed: AtomicU64,
    cancelled: AtomicU64,
    invocations: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events that entered dispatch.
    pub dispatched: u64,
    /// Events consumed by waiters.
    pub claimed: u64,
    /// Dispatches cancelled before finishing.
    pub cancelled: u64,
    /// Handler invocations (including failed predicates).
    pub invocations: u64,
    /// Plugin errors of any kind.
    pub errors: u64,
    /// Handler timeouts.
    pub timeouts: u64,
    /// Handler or predicate panics.
    pub panics: u64,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The central event dispatcher.
///
/// `Dispatcher` is `Send + Sync`; the orchestrator shares it as
/// `Arc<Dispatcher>`.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    state: Arc<StateStore>,
    waiters: Arc<EventWaiters>,
    router: Arc<dyn ActionRouter>,
    plugin_configs: RwLock<Arc<HashMap<String, Arc<Value>>>>,
    config: DispatchConfig,
    counters: DispatchCounters,
    tracker: TaskTracker,
    shutdown: Mutex<CancellationToken>,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`, routing outbound calls through
    /// `router`.
    pub fn new(
        registry: Arc<PluginRegistry>,
        router: Arc<dyn ActionRouter>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            state: Arc::new(StateStore::new()),
            waiters: Arc::new(EventWaiters::new()),
            router,
            plugin_configs: RwLock::new(Arc::new(HashMap::new())),
            config,
            counters: DispatchCounters::default(),
            tracker: TaskTracker::new(),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The shared state store.
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Pending event waiters.
    pub fn waiters(&self) -> &Arc<EventWaiters> {
        &self.waiters
    }

    /// Dispatcher settings.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Replaces the plugin configuration sections (`plugins.<name>`).
    pub fn set_plugin_configs(&self, configs: HashMap<String, Value>) {
        let configs = configs
            .into_iter()
            .map(|(name, value)| (name, Arc::new(value)))
            .collect();
        *self.plugin_configs.write() = Arc::new(configs);
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            claimed: c.claimed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            invocations: c.invocations.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
        }
    }

    /// Number of spawned dispatches still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Dispatches `event` in its own task.
    ///
    /// The task is tracked and cancelled by [`drain`](Self::drain).
    pub fn spawn(self: &Arc<Self>, event: Event) -> JoinHandle<DispatchOutcome> {
        let token = self.shutdown.lock().child_token();
        let dispatcher = Arc::clone(self);
        self.tracker
            .spawn(async move { dispatcher.dispatch_with_cancel(event, &token).await })
    }

    /// Waits for spawned dispatches to finish.
    ///
    /// Dispatches still running after `grace` are cancelled and awaited.
    /// Returns `true` if everything finished within the grace period. The
    /// dispatcher accepts new work again afterwards.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let clean = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !clean {
            let pending = self.tracker.len();
            warn!(pending, "Grace period elapsed, cancelling in-flight dispatches");
            self.shutdown.lock().cancel();
            self.tracker.wait().await;
        }

        *self.shutdown.lock() = CancellationToken::new();
        self.tracker.reopen();
        clean
    }

    /// Dispatches an event to completion.
    pub async fn dispatch(&self, event: Event) -> DispatchOutcome {
        self.dispatch_with_cancel(event, &CancellationToken::new())
            .await
    }

    /// Dispatches an event, stopping promptly when `cancel` fires.
    ///
    /// On cancellation the running handler is dropped, no further plugins
    /// run, and the outcome is flagged `cancelled`.
    pub async fn dispatch_with_cancel(
        &self,
        event: Event,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let span = span!(
            Level::DEBUG,
            "dispatch",
            event_id = %event.id(),
            event_name = %event.name(),
            adapter = %event.adapter_id(),
        );
        self.run(event, cancel).instrument(span).await
    }

    async fn run(&self, event: Event, cancel: &CancellationToken) -> DispatchOutcome {
        let started = Instant::now();
        let mut outcome = DispatchOutcome::new(event.id());
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        if self.waiters.offer(&event) {
            self.counters.claimed.fetch_add(1, Ordering::Relaxed);
            outcome.claimed = true;
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        let snapshot = self.registry.snapshot();
        outcome.generation = Some(snapshot.generation());

        let event_state = self.state.acquire_event_scope();
        let lease = match event.conversation_id() {
            Some(id) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.finish_cancelled(outcome, started);
                    }
                    lease = self.state.acquire_conversation_scope(id) => Some(lease),
                }
            }
            None => None,
        };

        let scope = Arc::new(DispatchScope::new(
            event.clone(),
            event_state,
            lease.as_ref().map(|l| l.handle()),
            OutboundCaller::new(event.adapter_id().clone(), Arc::clone(&self.router)),
            Arc::clone(&self.waiters),
        ));
        let configs = Arc::clone(&*self.plugin_configs.read());

        for entry in snapshot.enabled() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let plugin_started = Instant::now();
            let result = match self.evaluate(entry, &event) {
                Ok(true) => {
                    let cx = HandlerContext::new(
                        Arc::clone(&scope),
                        Arc::clone(entry.descriptor().shared_name()),
                        configs.get(entry.name()).cloned(),
                    );
                    match self.invoke(entry, cx, cancel).await {
                        Some(result) => result,
                        None => {
                            outcome.cancelled = true;
                            break;
                        }
                    }
                }
                Ok(false) => continue,
                Err(e) => Err(e),
            };

            self.record(&result);
            let stop = matches!(result, Ok(Outcome::Handled)) && entry.descriptor().is_blocking();
            outcome.invocations.push(Invocation {
                plugin: entry.name().to_string(),
                priority: entry.descriptor().get_priority(),
                result,
                elapsed: plugin_started.elapsed(),
            });

            if stop {
                debug!(plugin = entry.name(), "Blocking plugin handled event, stopping dispatch");
                outcome.blocked_by = Some(entry.name().to_string());
                break;
            }
        }

        drop(scope);
        drop(lease);

        if outcome.cancelled {
            return self.finish_cancelled(outcome, started);
        }
        outcome.elapsed = started.elapsed();
        trace!(
            ran = outcome.invocations.len(),
            elapsed = ?outcome.elapsed,
            "dispatch complete"
        );
        outcome
    }

    fn finish_cancelled(&self, mut outcome: DispatchOutcome, started: Instant) -> DispatchOutcome {
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        outcome.cancelled = true;
        outcome.elapsed = started.elapsed();
        debug!("dispatch cancelled");
        outcome
    }

    /// Runs the predicate, converting errors and panics into
    /// [`PluginError::PredicateFailed`].
    fn evaluate(&self, entry: &RegistryEntry, event: &Event) -> Result<bool, PluginError> {
        let plugin = entry.descriptor().plugin();
        match catch_unwind(AssertUnwindSafe(|| plugin.matches(event))) {
            Ok(Ok(matched)) => Ok(matched),
            Ok(Err(e)) => Err(PluginError::PredicateFailed {
                plugin: entry.name().to_string(),
                message: format!("{e:#}"),
            }),
            Err(panic) => {
                self.counters.panics.fetch_add(1, Ordering::Relaxed);
                Err(PluginError::PredicateFailed {
                    plugin: entry.name().to_string(),
                    message: format!("panicked: {}", panic_message(&*panic)),
                })
            }
        }
    }

    /// Runs the handler under its deadline. Returns `None` if cancelled.
    async fn invoke(
        &self,
        entry: &RegistryEntry,
        cx: HandlerContext,
        cancel: &CancellationToken,
    ) -> Option<Result<Outcome, PluginError>> {
        let descriptor = entry.descriptor();
        let timeout = descriptor
            .get_timeout()
            .unwrap_or(self.config.handler_timeout);
        let handler = AssertUnwindSafe(descriptor.plugin().handle(cx)).catch_unwind();

        let span = span!(Level::DEBUG, "plugin", plugin = entry.name());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = tokio::time::timeout(timeout, handler).instrument(span) => result,
        };

        let plugin = entry.name().to_string();
        Some(match result {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(e))) => Err(PluginError::Failed {
                plugin,
                message: format!("{e:#}"),
            }),
            Ok(Err(panic)) => {
                self.counters.panics.fetch_add(1, Ordering::Relaxed);
                Err(PluginError::Panicked {
                    plugin,
                    message: panic_message(&*panic),
                })
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(PluginError::Timeout { plugin, timeout })
            }
        })
    }

    fn record(&self, result: &Result<Outcome, PluginError>) {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(plugin = e.plugin(), error = %e, "plugin invocation failed");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher_builders::{PluginBuilder, on_command, on_message};
    use crate::plugin::PluginDescriptor;
    use async_trait::async_trait;
    use brass_core::{Action, AdapterId, ApiResult, ConversationId, EventKind};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Barrier, Notify};
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct RecordingRouter {
        sent: Mutex<Vec<(AdapterId, Action)>>,
    }

    #[async_trait]
    impl ActionRouter for RecordingRouter {
        async fn route(&self, adapter: &AdapterId, action: Action) -> ApiResult<Value> {
            self.sent.lock().push((adapter.clone(), action));
            Ok(Value::Null)
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(RecordingRouter::default()),
            DispatchConfig::default(),
        ))
    }

    fn event() -> Event {
        Event::builder("test", EventKind::Message).text("hello").build()
    }

    fn event_in(conversation: &str) -> Event {
        Event::builder("test", EventKind::Message)
            .conversation(conversation)
            .text("hello")
            .build()
    }

    fn returning(name: &str, priority: i32, block: bool, outcome: Outcome) -> PluginDescriptor {
        PluginBuilder::new(name)
            .priority(priority)
            .block(block)
            .handler(move |_| async move { Ok(outcome) })
    }

    fn failing(name: &str, priority: i32) -> PluginDescriptor {
        PluginBuilder::new(name)
            .priority(priority)
            .block(true)
            .handler(|_| async { anyhow::bail!("boom") })
    }

    #[tokio::test]
    async fn test_no_plugins() {
        let d = dispatcher();
        let outcome = d.dispatch(event()).await;
        assert!(outcome.invocations.is_empty());
        assert!(!outcome.handled());
        assert_eq!(outcome.generation, Some(0));
    }

    #[tokio::test]
    async fn test_priority_order_with_registration_tie_break() {
        let d = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [("A", 10), ("B", 5), ("C", 10), ("D", -1)] {
            let order = Arc::clone(&order);
            let name_owned = name.to_string();
            assert_ok!(d.registry().register(PluginBuilder::new(name).priority(priority).handler(
                move |_| {
                    let order = Arc::clone(&order);
                    let name = name_owned.clone();
                    async move {
                        order.lock().push(name);
                        Ok(Outcome::Pass)
                    }
                }
            )));
        }

        let outcome = d.dispatch(event()).await;
        assert_eq!(outcome.ran(), vec!["D", "B", "A", "C"]);
        assert_eq!(*order.lock(), vec!["D", "B", "A", "C"]);
    }

    #[tokio::test]
    async fn test_blocking_plugin_stops_chain() {
        let d = dispatcher();
        assert_ok!(d.registry().register(returning("A", 0, true, Outcome::Handled)));
        assert_ok!(d.registry().register(returning("B", 1, false, Outcome::Handled)));

        let outcome = d.dispatch(event()).await;
        assert_eq!(outcome.ran(), vec!["A"]);
        assert_eq!(outcome.blocked_by.as_deref(), Some("A"));
        assert!(matches!(outcome.result_of("A"), Some(Ok(Outcome::Handled))));
        assert!(outcome.result_of("B").is_none());
    }

    #[tokio::test]
    async fn test_blocking_plugin_that_passes_does_not_block() {
        let d = dispatcher();
        assert_ok!(d.registry().register(returning("A", 0, true, Outcome::Pass)));
        assert_ok!(d.registry().register(returning("B", 1, false, Outcome::Handled)));

        let outcome = d.dispatch(event()).await;
        assert_eq!(outcome.ran(), vec!["A", "B"]);
        assert!(outcome.blocked_by.is_none());
    }

    #[tokio::test]
    async fn test_error_is_isolated() {
        let d = dispatcher();
        assert_ok!(d.registry().register(failing("A", 0)));
        assert_ok!(d.registry().register(returning("B", 1, false, Outcome::Handled)));

        let outcome = d.dispatch(event()).await;
        assert_eq!(outcome.ran(), vec!["A", "B"]);
        assert!(matches!(
            outcome.result_of("A"),
            Some(Err(PluginError::Failed { message, .. })) if message.contains("boom")
        ));
        assert!(matches!(outcome.result_of("B"), Some(Ok(Outcome::Handled))));
        assert!(outcome.blocked_by.is_none());
        assert_eq!(d.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let d = dispatcher();
        assert_ok!(d.registry().register(
            PluginBuilder::new("A")
                .block(true)
                .handler(|_| async { panic!("handler exploded") })
        ));
        assert_ok!(d.registry().register(returning("B", 1, false, Outcome::Handled)));

        let outcome = d.dispatch(event()).await;
        assert!(matches!(
            outcome.result_of("A"),
            Some(Err(PluginError::Panicked { message, .. })) if message == "handler exploded"
        ));
        assert!(outcome.handled());
        assert_eq!(d.stats().panics, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_isolated() {
        let d = dispatcher();
        assert_ok!(d.registry().register(
            PluginBuilder::new("slow")
                .block(true)
                .timeout(Duration::from_secs(1))
                .handler(|_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Outcome::Handled)
                })
        ));
        assert_ok!(d.registry().register(returning("next", 1, false, Outcome::Handled)));

        let outcome = d.dispatch(event()).await;
        assert!(matches!(
            outcome.result_of("slow"),
            Some(Err(PluginError::Timeout { timeout, .. })) if *timeout == Duration::from_secs(1)
        ));
        assert!(matches!(outcome.result_of("next"), Some(Ok(Outcome::Handled))));
        assert_eq!(d.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let d = Arc::new(Dispatcher::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(RecordingRouter::default()),
            DispatchConfig {
                handler_timeout: Duration::from_millis(200),
            },
        ));
        assert_ok!(d.registry().register(PluginBuilder::new("slow").handler(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Outcome::Handled)
        })));

        let outcome = d.dispatch(event()).await;
        assert!(matches!(
            outcome.result_of("slow"),
            Some(Err(PluginError::Timeout { timeout, .. })) if *timeout == Duration::from_millis(200)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_timeout_outlasts_default() {
        let d = Arc::new(Dispatcher::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(RecordingRouter::default()),
            DispatchConfig {
                handler_timeout: Duration::from_millis(200),
            },
        ));
        assert_ok!(d.registry().register(
            PluginBuilder::new("patient")
                .timeout(Duration::from_secs(60))
                .handler(|_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Outcome::Handled)
                })
        ));

        let outcome = d.dispatch(event()).await;
        assert!(matches!(outcome.result_of("patient"), Some(Ok(Outcome::Handled))));
        assert_eq!(d.stats().timeouts, 0);
    }

    #[tokio::test]
    async fn test_predicate_failure_is_isolated() {
        let d = dispatcher();
        assert_ok!(d.registry().register(
            PluginBuilder::new("bad-rule")
                .block(true)
                .try_rule(|_| anyhow::bail!("cannot decide"))
                .handler(|_| async { Ok(Outcome::Handled) })
        ));
        assert_ok!(d.registry().register(
            PluginBuilder::new("panicky-rule")
                .priority(1)
                .rule(|_| panic!("rule exploded"))
                .handler(|_| async { Ok(Outcome::Handled) })
        ));
        assert_ok!(d.registry().register(returning("ok", 2, false, Outcome::Handled)));

        let outcome = d.dispatch(event()).await;
        assert_eq!(outcome.ran(), vec!["ok"]);
        assert_eq!(outcome.errors().count(), 2);
        assert!(
            outcome
                .errors()
                .all(|e| matches!(e, PluginError::PredicateFailed { .. }))
        );
    }

    #[tokio::test]
    async fn test_non_matching_and_disabled_plugins_are_skipped() {
        let d = dispatcher();
        assert_ok!(d.registry().register(
            on_command("echo").handler(|_| async { Ok(Outcome::Handled) })
        ));
        assert_ok!(d.registry().register(returning("off", 0, false, Outcome::Handled)));
        assert_ok!(d.registry().disable("off"));

        let outcome = d.dispatch(event()).await;
        assert!(outcome.invocations.is_empty());
    }

    #[tokio::test]
    async fn test_state_is_shared_within_dispatch_only() {
        let d = dispatcher();
        assert_ok!(d.registry().register(PluginBuilder::new("writer").handler(|cx| async move {
            cx.state().set("seen", true)?;
            Ok(Outcome::Pass)
        })));
        assert_ok!(d.registry().register(PluginBuilder::new("reader").priority(1).handler(
            |cx| async move {
                if cx.state().get("seen") == Some(json!(true)) {
                    Ok(Outcome::Handled)
                } else {
                    anyhow::bail!("state not shared")
                }
            }
        )));

        for _ in 0..2 {
            let outcome = d.dispatch(event()).await;
            assert!(matches!(outcome.result_of("reader"), Some(Ok(Outcome::Handled))));
        }
    }

    #[tokio::test]
    async fn test_conversation_state_persists() {
        let d = dispatcher();
        assert_ok!(d.registry().register(on_message().name("counter").handler(|cx| async move {
            let state = cx
                .conversation_state()
                .ok_or_else(|| anyhow::anyhow!("no conversation"))?;
            state.update("count", |v| json!(v.and_then(Value::as_u64).unwrap_or(0) + 1))?;
            Ok(Outcome::Handled)
        })));

        for _ in 0..3 {
            d.dispatch(event_in("c1")).await;
        }
        d.dispatch(event_in("c2")).await;

        let lease = d
            .state()
            .acquire_conversation_scope(&ConversationId::new("c1"))
            .await;
        assert_eq!(lease.handle().get("count"), Some(json!(3)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_conversation_never_overlaps() {
        let d = dispatcher();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            assert_ok!(d.registry().register(PluginBuilder::new("stateful").handler(move |cx| {
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    if let Some(state) = cx.conversation_state() {
                        state.set("touched", true)?;
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Outcome::Handled)
                }
            })));
        }

        let handles: Vec<_> = (0..4).map(|_| d.spawn(event_in("c1"))).collect();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.handled());
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_conversations_run_concurrently() {
        let d = dispatcher();
        let barrier = Arc::new(Barrier::new(3));
        {
            let barrier = Arc::clone(&barrier);
            assert_ok!(d.registry().register(PluginBuilder::new("rendezvous").handler(
                move |_| {
                    let barrier = Arc::clone(&barrier);
                    async move {
                        barrier.wait().await;
                        Ok(Outcome::Handled)
                    }
                }
            )));
        }

        // Completes only if all three handlers are inside at the same time.
        let handles = vec![
            d.spawn(event_in("c1")),
            d.spawn(event_in("c2")),
            d.spawn(event()),
        ];
        for handle in handles {
            let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("dispatches should not serialize")
                .unwrap();
            assert!(outcome.handled());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_swap_does_not_affect_in_flight_dispatch() {
        let d = dispatcher();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            assert_ok!(d.registry().register(PluginBuilder::new("old-first").handler(
                move |_| {
                    let entered = Arc::clone(&entered);
                    let release = Arc::clone(&release);
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok(Outcome::Pass)
                    }
                }
            )));
        }
        assert_ok!(d.registry().register(returning("old-second", 1, false, Outcome::Pass)));
        let old_generation = d.registry().generation();

        let in_flight = d.spawn(event());
        entered.notified().await;

        let new_generation = assert_ok!(d.registry().swap(vec![returning(
            "new",
            0,
            false,
            Outcome::Handled
        )]));
        release.notify_one();

        let outcome = in_flight.await.unwrap();
        assert_eq!(outcome.generation, Some(old_generation));
        assert_eq!(outcome.ran(), vec!["old-first", "old-second"]);

        let after = d.dispatch(event()).await;
        assert_eq!(after.generation, Some(new_generation));
        assert_eq!(after.ran(), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_lease() {
        let d = dispatcher();
        assert_ok!(d.registry().register(PluginBuilder::new("stuck").handler(|_| async {
            std::future::pending::<()>().await;
            Ok(Outcome::Handled)
        })));
        assert_ok!(d.registry().register(returning("after", 1, false, Outcome::Handled)));

        let token = CancellationToken::new();
        let task = {
            let d = Arc::clone(&d);
            let token = token.clone();
            tokio::spawn(async move { d.dispatch_with_cancel(event_in("c1"), &token).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = ConversationId::new("c1");
        assert!(d.state().try_acquire_conversation_scope(&id).is_none());

        token.cancel();
        let outcome = task.await.unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.invocations.is_empty());
        assert!(d.state().try_acquire_conversation_scope(&id).is_some());
        assert_eq!(d.stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting_for_lease() {
        let d = dispatcher();
        assert_ok!(d.registry().register(returning("any", 0, false, Outcome::Handled)));

        let id = ConversationId::new("c1");
        let held = d.state().acquire_conversation_scope(&id).await;

        let token = CancellationToken::new();
        token.cancel();
        let outcome = d.dispatch_with_cancel(event_in("c1"), &token).await;
        assert!(outcome.cancelled);
        assert!(outcome.invocations.is_empty());
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_cancels_after_grace() {
        let d = dispatcher();
        assert_ok!(d.registry().register(PluginBuilder::new("stuck").handler(|_| async {
            std::future::pending::<()>().await;
            Ok(Outcome::Handled)
        })));

        let handle = d.spawn(event_in("c1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(d.in_flight(), 1);

        assert!(!d.drain(Duration::from_secs(1)).await);
        assert!(handle.await.unwrap().cancelled);
        assert_eq!(d.in_flight(), 0);

        // New work is accepted and not pre-cancelled.
        assert_ok!(d.registry().swap(vec![returning("quick", 0, false, Outcome::Handled)]));
        assert!(d.spawn(event()).await.unwrap().handled());
        assert!(d.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_claims_next_event_of_conversation() {
        let d = dispatcher();
        let answers = Arc::new(Mutex::new(Vec::new()));
        {
            let answers = Arc::clone(&answers);
            assert_ok!(d.registry().register(on_command("ask").block(true).handler(move |cx| {
                let answers = Arc::clone(&answers);
                async move {
                    if let Some(next) = cx.next_event(Duration::from_secs(5)).await {
                        answers.lock().push(next.plain_text().to_string());
                    }
                    Ok(Outcome::Handled)
                }
            })));
        }
        assert_ok!(d.registry().register(
            on_message().name("fallback").priority(10).handler(|_| async { Ok(Outcome::Handled) })
        ));

        let ask = Event::builder("test", EventKind::Message)
            .conversation("c1")
            .text("/ask")
            .build();
        let question = d.spawn(ask);
        while d.waiters().pending() == 0 {
            tokio::task::yield_now().await;
        }

        let answer = d.dispatch(event_in("c1")).await;
        assert!(answer.claimed);
        assert!(answer.invocations.is_empty());

        let outcome = question.await.unwrap();
        assert!(outcome.handled());
        assert_eq!(*answers.lock(), vec!["hello"]);
        assert_eq!(d.stats().claimed, 1);
    }

    #[tokio::test]
    async fn test_plugin_config_and_outbound_reply() {
        let router = Arc::new(RecordingRouter::default());
        let d = Dispatcher::new(
            Arc::new(PluginRegistry::new()),
            router.clone(),
            DispatchConfig::default(),
        );

        #[derive(Default, serde::Deserialize)]
        struct GreetConfig {
            greeting: String,
        }

        d.set_plugin_configs(HashMap::from([(
            "greeter".to_string(),
            json!({"greeting": "howdy"}),
        )]));
        assert_ok!(d.registry().register(on_message().name("greeter").handler(|cx| async move {
            let cfg: GreetConfig = cx.config()?;
            cx.reply(cfg.greeting).await?;
            Ok(Outcome::Handled)
        })));

        let outcome = d.dispatch(event_in("room")).await;
        assert!(outcome.handled());

        let sent = router.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_str(), "test");
        assert_eq!(sent[0].1.params["message"], "howdy");
    }
}
