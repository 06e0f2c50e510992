//! Main runtime orchestration.
//!
//! [`BrassRuntime`] owns the plugin registry, the adapter registry and the
//! dispatcher. It starts adapters, forwards the events they emit into
//! dispatch, serves hot-reload requests and shuts everything down in order.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use brass_runtime::BrassRuntime;
//!
//! // Auto-loads brass.toml from the current directory
//! let runtime = BrassRuntime::new();
//!
//! // Custom configuration path
//! let runtime = BrassRuntime::builder()
//!     .config_file("config/brass.toml")
//!     .build()?;
//!
//! runtime.register_adapter::<ConsoleAdapter>().await?;
//! runtime.register_plugin(on_command("ping").handler(|cx| async move {
//!     cx.reply("pong").await?;
//!     Ok(Outcome::Handled)
//! }))?;
//! runtime.run().await?;
//! ```
//!
//! # Shutdown order
//!
//! 1. Adapter event intake stops
//! 2. In-flight dispatches get `dispatch.shutdown_grace_ms` to finish, then
//!    the rest are cancelled (their conversation leases are released)
//! 3. Shutdown hooks run
//! 4. Adapters are stopped

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use brass_core::{
    AdapterContext, AdapterId, AdapterResult, AdapterState, BoxedAdapter, ConfigurableAdapter,
    Event, OutboundCaller,
};
use brass_framework::{DispatchStats, Dispatcher, PluginDescriptor, PluginRegistry};
use serde::Serialize;
use tokio::signal;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::adapters::{AdapterRegistry, AdapterSlot};
use crate::config::{BrassConfig, ConfigLoader, ConfigResult};
use crate::error::{RuntimeError, RuntimeResult};
use crate::hooks::{HookContext, HookPhase, LifecycleHooks};
use crate::logging;
use crate::reload::{PluginSource, ReloadHandle, Reloader};

/// Point-in-time view of the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    /// Whether `start` has run and `stop` has not.
    pub running: bool,
    /// Registered adapters with their lifecycle states, ordered by id.
    pub adapters: Vec<(AdapterId, AdapterState)>,
    /// Plugins in the current registry snapshot.
    pub plugins: usize,
    /// Registry generation, bumped on every change.
    pub generation: u64,
    /// Dispatches currently running.
    pub in_flight: usize,
    /// Conversations holding state or a live lease.
    pub conversations: usize,
    /// Dispatcher counters.
    pub dispatch: DispatchStats,
}

#[derive(Default)]
struct Lifecycle {
    intake: CancellationToken,
    reload: Option<(CancellationToken, JoinHandle<()>)>,
}

/// The Brass runtime: adapters in, plugins through, replies out.
pub struct BrassRuntime {
    config: BrassConfig,
    plugins: Arc<PluginRegistry>,
    adapters: Arc<AdapterRegistry>,
    dispatcher: Arc<Dispatcher>,
    hooks: LifecycleHooks,
    reloader: Arc<Reloader>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
}

impl BrassRuntime {
    /// Creates a new runtime with automatic configuration loading.
    ///
    /// Searches the current directory and the user config directory for
    /// `brass.toml`. If loading fails, default settings are used.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .with_user_config_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                BrassConfig::default()
            });

        Self::from_config(&config)
    }

    /// Creates a runtime builder for custom configuration.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a new runtime from configuration.
    ///
    /// Initializes logging (unless a subscriber is already installed) and
    /// hands the `plugins.*` sections to the dispatcher.
    pub fn from_config(config: &BrassConfig) -> Self {
        logging::init_from_config(&config.logging);

        let plugins = Arc::new(PluginRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&plugins),
            adapters.clone(),
            config.dispatch.to_dispatch_config(),
        ));
        dispatcher.set_plugin_configs(config.plugins.clone());
        let reloader = Arc::new(Reloader::new(Arc::clone(&plugins)));

        info!(
            log_level = %config.logging.level,
            handler_timeout_ms = config.dispatch.handler_timeout_ms,
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            plugins,
            adapters,
            dispatcher,
            hooks: LifecycleHooks::new(),
            reloader,
            lifecycle: Mutex::new(Lifecycle::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &BrassConfig {
        &self.config
    }

    /// The plugin registry.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// The adapter registry.
    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Returns whether the runtime is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // =========================================================================
    // Adapter Management
    // =========================================================================

    /// Registers a configurable adapter under [`ConfigurableAdapter::name`].
    ///
    /// The `adapters.<name>` section is deserialized into `A::Config`; when it
    /// is absent the default configuration is used. If the runtime is already
    /// running the adapter is started right away.
    pub async fn register_adapter<A>(&self) -> RuntimeResult<()>
    where
        A: ConfigurableAdapter,
    {
        let adapter_name = A::name();

        let config: A::Config = if let Some(value) = self.config.adapters.get(adapter_name) {
            serde_json::from_value(value.clone()).map_err(|e| {
                RuntimeError::AdapterConfigDeserialize(format!(
                    "Failed to deserialize config for adapter '{adapter_name}': {e}"
                ))
            })?
        } else {
            warn!(
                adapter = adapter_name,
                "No configuration found for adapter, using default"
            );
            Default::default()
        };

        let adapter = A::from_config(config)?;
        self.add_adapter(adapter_name, adapter).await
    }

    /// Adds an adapter instance under `id`.
    ///
    /// On a running runtime the adapter is started immediately; a start
    /// failure is returned and leaves the adapter registered but `Stopped`.
    pub async fn add_adapter(
        &self,
        id: impl Into<AdapterId>,
        adapter: BoxedAdapter,
    ) -> RuntimeResult<()> {
        let lifecycle = self.lifecycle.lock().await;
        let slot = self.adapters.insert(id.into(), adapter)?;
        info!(adapter = %slot.id(), "Registered adapter");

        if self.is_running() {
            self.start_slot(&slot, &lifecycle.intake).await?;
        }
        Ok(())
    }

    /// Removes an adapter, stopping it first if it is active.
    ///
    /// Outbound calls to `id` fail with `AdapterUnavailable` from the moment
    /// this is called.
    pub async fn remove_adapter(&self, id: &AdapterId) -> RuntimeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let slot = self
            .adapters
            .remove(id)
            .ok_or_else(|| RuntimeError::AdapterNotFound(id.to_string()))?;
        stop_slot(&slot).await;
        info!(adapter = %id, "Removed adapter");
        Ok(())
    }

    /// Outbound caller bound to `adapter`.
    pub fn caller(&self, adapter: impl Into<AdapterId>) -> OutboundCaller {
        OutboundCaller::new(adapter.into(), self.adapters.clone())
    }

    // =========================================================================
    // Plugins and Reload
    // =========================================================================

    /// Registers one plugin.
    pub fn register_plugin(&self, plugin: PluginDescriptor) -> RuntimeResult<()> {
        let name = plugin.name().to_string();
        self.plugins.register(plugin)?;
        debug!(plugin = %name, "Registered plugin");
        Ok(())
    }

    /// Registers several plugins, stopping at the first rejected one.
    pub fn register_plugins(
        &self,
        plugins: impl IntoIterator<Item = PluginDescriptor>,
    ) -> RuntimeResult<()> {
        for plugin in plugins {
            self.register_plugin(plugin)?;
        }
        Ok(())
    }

    /// Replaces the whole plugin set and returns the new generation.
    pub fn reload(&self, plugins: Vec<PluginDescriptor>) -> RuntimeResult<u64> {
        self.reloader.swap(plugins)
    }

    /// Reloads from the plugin source set with
    /// [`set_plugin_source`](Self::set_plugin_source).
    pub async fn refresh(&self) -> RuntimeResult<u64> {
        self.reloader.refresh().await
    }

    /// Sets where [`refresh`](Self::refresh) gets its plugin set from.
    pub fn set_plugin_source(&self, source: impl PluginSource + 'static) {
        self.reloader.set_source(Arc::new(source));
    }

    /// Handle for triggering reloads from other tasks.
    pub fn reload_handle(&self) -> ReloadHandle {
        self.reloader.handle()
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Adds a hook run after adapters have started.
    pub fn on_startup<F, Fut>(&self, name: impl AsRef<str>, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_startup(name, hook);
    }

    /// Adds a hook run before adapters are stopped.
    pub fn on_shutdown<F, Fut>(&self, name: impl AsRef<str>, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_shutdown(name, hook);
    }

    fn hook_context(&self) -> HookContext {
        HookContext::new(Arc::clone(&self.adapters), Arc::clone(&self.plugins))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts all adapters, runs startup hooks and begins serving reloads.
    ///
    /// An adapter that fails to start is logged and left `Stopped`; the
    /// others keep running.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            warn!("Runtime is already running");
            return Ok(());
        }

        info!("Starting Brass runtime");
        lifecycle.intake = CancellationToken::new();

        for slot in self.adapters.slots() {
            if let Err(e) = self.start_slot(&slot, &lifecycle.intake).await {
                error!(adapter = %slot.id(), error = %e, "Failed to start adapter");
            }
        }
        self.running.store(true, Ordering::Release);

        self.hooks
            .run(HookPhase::Startup, &self.hook_context())
            .await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.reloader).run(cancel.clone()));
        lifecycle.reload = Some((cancel, task));

        info!(
            adapters = self.adapters.len(),
            plugins = self.plugins.len(),
            "Runtime started"
        );
        Ok(())
    }

    /// Stops intake, drains dispatches, runs shutdown hooks and stops adapters.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            warn!("Runtime is not running");
            return Ok(());
        }

        info!("Stopping Brass runtime");
        lifecycle.intake.cancel();
        if let Some((cancel, task)) = lifecycle.reload.take() {
            cancel.cancel();
            let _ = task.await;
        }

        let grace = self.config.dispatch.shutdown_grace();
        if self.dispatcher.drain(grace).await {
            debug!("All in-flight dispatches finished");
        }

        self.hooks
            .run(HookPhase::Shutdown, &self.hook_context())
            .await;

        for slot in self.adapters.slots() {
            stop_slot(&slot).await;
        }
        self.running.store(false, Ordering::Release);

        info!("Runtime stopped");
        Ok(())
    }

    /// Runs the runtime until a shutdown signal is received.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;

        info!("Brass runtime is now running. Press Ctrl+C to stop.");
        wait_for_shutdown().await;

        self.stop().await
    }

    /// Runs the runtime with a custom shutdown future.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    /// Waits for the next event matching `predicate`.
    ///
    /// The matching event is consumed and not dispatched to plugins.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> RuntimeResult<Event>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.dispatcher
            .waiters()
            .wait_for(predicate, timeout)
            .await
            .ok_or(RuntimeError::WaitTimeout(timeout))
    }

    /// Current statistics.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            running: self.is_running(),
            adapters: self.adapters.list(),
            plugins: self.plugins.len(),
            generation: self.plugins.generation(),
            in_flight: self.dispatcher.in_flight(),
            conversations: self.dispatcher.state().conversation_count(),
            dispatch: self.dispatcher.stats(),
        }
    }

    /// Starts one adapter: wires its event channel into dispatch, then calls
    /// `start`.
    async fn start_slot(
        &self,
        slot: &Arc<AdapterSlot>,
        intake: &CancellationToken,
    ) -> AdapterResult<()> {
        let (tx, rx) = mpsc::channel(self.config.dispatch.event_buffer);
        let shutdown = slot.renew_shutdown();
        slot.set_pump(spawn_pump(
            Arc::clone(&self.dispatcher),
            slot.id().clone(),
            rx,
            intake.clone(),
            shutdown.clone(),
        ));
        slot.set_state(AdapterState::Starting);

        let ctx = AdapterContext::new(slot.id().clone(), tx, slot.state_sender(), shutdown);
        match slot.adapter().start(ctx).await {
            Ok(()) => {
                slot.mark_running();
                info!(adapter = %slot.id(), state = %slot.state(), "Adapter started");
                Ok(())
            }
            Err(e) => {
                slot.set_state(AdapterState::Stopped);
                slot.cancel();
                if let Some(pump) = slot.take_pump() {
                    let _ = pump.await;
                }
                Err(e)
            }
        }
    }
}

impl Default for BrassRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrassRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrassRuntime")
            .field("running", &self.is_running())
            .field("adapters", &self.adapters)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Stops one adapter and waits for its event pump to exit.
async fn stop_slot(slot: &AdapterSlot) {
    if slot.state() == AdapterState::Stopped {
        if let Some(pump) = slot.take_pump() {
            pump.abort();
        }
        return;
    }

    slot.set_state(AdapterState::Stopping);
    slot.cancel();
    if let Err(e) = slot.adapter().stop().await {
        error!(adapter = %slot.id(), error = %e, "Error during adapter shutdown");
    }
    slot.set_state(AdapterState::Stopped);

    if let Some(pump) = slot.take_pump() {
        let _ = pump.await;
    }
    info!(adapter = %slot.id(), "Adapter stopped");
}

/// Forwards one adapter's events into dispatch until intake stops.
///
/// Dropping the receiver on exit makes further `emit` calls fail.
fn spawn_pump(
    dispatcher: Arc<Dispatcher>,
    id: AdapterId,
    mut rx: mpsc::Receiver<Event>,
    intake: CancellationToken,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = intake.cancelled() => break,
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        trace!(adapter = %id, event_id = %event.id(), "event received");
                        let _ = dispatcher.spawn(event);
                    }
                    None => break,
                },
            }
        }
        debug!(adapter = %id, "Event intake closed");
    })
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl+C only");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for creating a `BrassRuntime` with custom configuration.
///
/// ```rust,ignore
/// let runtime = BrassRuntime::builder()
///     .config_file("config/brass.toml")
///     .profile("production")
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges a partial configuration source over files and environment.
    pub fn merge<P: figment::Provider>(mut self, provider: P) -> Self {
        self.config_loader = self.config_loader.merge(provider);
        self
    }

    /// Overrides one dotted configuration key.
    pub fn set<V: serde::Serialize>(mut self, key: &str, value: V) -> Self {
        self.config_loader = self.config_loader.set(key, value);
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> ConfigResult<BrassRuntime> {
        let config = self.config_loader.load()?;
        Ok(BrassRuntime::from_config(&config))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
