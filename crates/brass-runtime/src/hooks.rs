//! Startup and shutdown hooks.
//!
//! Startup hooks run after adapters have been started, shutdown hooks before
//! they are stopped. Hooks run one after another in registration order. A
//! failing or panicking hook is logged and the remaining hooks still run.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use brass_core::{AdapterId, AdapterState, OutboundCaller};
use brass_framework::PluginRegistry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::adapters::AdapterRegistry;

/// What a hook can reach: outbound calls and the plugin registry.
#[derive(Clone)]
pub struct HookContext {
    adapters: Arc<AdapterRegistry>,
    plugins: Arc<PluginRegistry>,
}

impl HookContext {
    pub(crate) fn new(adapters: Arc<AdapterRegistry>, plugins: Arc<PluginRegistry>) -> Self {
        Self { adapters, plugins }
    }

    /// Outbound caller bound to `adapter`.
    pub fn caller(&self, adapter: impl Into<AdapterId>) -> OutboundCaller {
        OutboundCaller::new(adapter.into(), self.adapters.clone())
    }

    /// Registered adapters and their states.
    pub fn adapters(&self) -> Vec<(AdapterId, AdapterState)> {
        self.adapters.list()
    }

    /// The plugin registry.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }
}

impl fmt::Debug for HookContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookContext")
            .field("adapters", &self.adapters.len())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Hook {
    name: Arc<str>,
    run: HookFn,
}

/// Named startup and shutdown hooks.
#[derive(Default)]
pub struct LifecycleHooks {
    startup: RwLock<Vec<Hook>>,
    shutdown: RwLock<Vec<Hook>>,
}

/// Which list a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Runs after adapters are started, before events are dispatched.
    Startup,
    /// Runs after dispatch has drained, before adapters are stopped.
    Shutdown,
}

impl HookPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
        }
    }
}

impl LifecycleHooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a startup hook.
    pub fn on_startup<F, Fut>(&self, name: impl AsRef<str>, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(HookPhase::Startup, name.as_ref(), hook);
    }

    /// Adds a shutdown hook.
    pub fn on_shutdown<F, Fut>(&self, name: impl AsRef<str>, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(HookPhase::Shutdown, name.as_ref(), hook);
    }

    fn push<F, Fut>(&self, phase: HookPhase, name: &str, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry = Hook {
            name: Arc::from(name),
            run: Arc::new(move |cx| Box::pin(hook(cx))),
        };
        self.list(phase).write().push(entry);
    }

    fn list(&self, phase: HookPhase) -> &RwLock<Vec<Hook>> {
        match phase {
            HookPhase::Startup => &self.startup,
            HookPhase::Shutdown => &self.shutdown,
        }
    }

    /// Number of hooks registered for `phase`.
    pub fn count(&self, phase: HookPhase) -> usize {
        self.list(phase).read().len()
    }

    /// Runs every hook of `phase`; returns how many failed.
    pub async fn run(&self, phase: HookPhase, cx: &HookContext) -> usize {
        let hooks: Vec<(Arc<str>, HookFn)> = self
            .list(phase)
            .read()
            .iter()
            .map(|hook| (Arc::clone(&hook.name), Arc::clone(&hook.run)))
            .collect();
        if hooks.is_empty() {
            return 0;
        }

        debug!(phase = phase.as_str(), count = hooks.len(), "running lifecycle hooks");
        let mut failed = 0;
        for (name, run) in hooks {
            let result = AssertUnwindSafe(run(cx.clone())).catch_unwind().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(hook = %name, phase = phase.as_str(), error = %e, "lifecycle hook failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(hook = %name, phase = phase.as_str(), "lifecycle hook panicked");
                }
            }
        }
        failed
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("startup", &self.count(HookPhase::Startup))
            .field("shutdown", &self.count(HookPhase::Shutdown))
            .finish()
    }
}
