//! Hot reload of the plugin set.
//!
//! A [`ReloadHandle`] is a cloneable channel into the runtime. Each request
//! is answered with the generation of the published snapshot or the reason
//! it was rejected. Dispatches already in flight keep the snapshot they
//! started with.
//!
//! ```rust,ignore
//! let handle = runtime.reload_handle();
//! tokio::spawn(async move {
//!     while let Some(()) = trigger.recv().await {
//!         match handle.refresh().await {
//!             Ok(generation) => info!(generation, "plugins reloaded"),
//!             Err(e) => warn!(error = %e, "reload rejected"),
//!         }
//!     }
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use brass_framework::{PluginDescriptor, PluginRegistry};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};

const RELOAD_QUEUE: usize = 16;

/// Produces a complete plugin set on demand.
#[async_trait]
pub trait PluginSource: Send + Sync {
    /// Builds the full plugin set. An error leaves the current set in place.
    async fn load(&self) -> anyhow::Result<Vec<PluginDescriptor>>;
}

#[async_trait]
impl<F, Fut> PluginSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<PluginDescriptor>>> + Send,
{
    async fn load(&self) -> anyhow::Result<Vec<PluginDescriptor>> {
        (self)().await
    }
}

/// A request handled by the reload loop.
pub enum ReloadRequest {
    /// Replace the plugin set with the given one.
    Swap {
        /// The complete new set.
        plugins: Vec<PluginDescriptor>,
        /// Receives the new generation or the rejection.
        reply: oneshot::Sender<RuntimeResult<u64>>,
    },
    /// Ask the configured [`PluginSource`] for a new set and swap it in.
    Refresh {
        /// Receives the new generation or the failure.
        reply: oneshot::Sender<RuntimeResult<u64>>,
    },
}

/// Cloneable sender of reload requests.
///
/// Requests sent while the runtime is stopped are served once it starts.
#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<ReloadRequest>,
}

impl ReloadHandle {
    /// Swaps in `plugins`, returning the new registry generation.
    pub async fn swap(&self, plugins: Vec<PluginDescriptor>) -> RuntimeResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(ReloadRequest::Swap { plugins, reply }, rx).await
    }

    /// Reloads from the runtime's plugin source.
    pub async fn refresh(&self) -> RuntimeResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(ReloadRequest::Refresh { reply }, rx).await
    }

    async fn send(
        &self,
        request: ReloadRequest,
        rx: oneshot::Receiver<RuntimeResult<u64>>,
    ) -> RuntimeResult<u64> {
        self.tx
            .send(request)
            .await
            .map_err(|_| RuntimeError::ReloadClosed)?;
        rx.await.map_err(|_| RuntimeError::ReloadClosed)?
    }
}

impl std::fmt::Debug for ReloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Applies reload requests to the plugin registry.
pub(crate) struct Reloader {
    registry: Arc<PluginRegistry>,
    source: RwLock<Option<Arc<dyn PluginSource>>>,
    requests: Arc<Mutex<mpsc::Receiver<ReloadRequest>>>,
    tx: mpsc::Sender<ReloadRequest>,
}

impl Reloader {
    pub(crate) fn new(registry: Arc<PluginRegistry>) -> Self {
        let (tx, rx) = mpsc::channel(RELOAD_QUEUE);
        Self {
            registry,
            source: RwLock::new(None),
            requests: Arc::new(Mutex::new(rx)),
            tx,
        }
    }

    pub(crate) fn handle(&self) -> ReloadHandle {
        ReloadHandle {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn set_source(&self, source: Arc<dyn PluginSource>) {
        *self.source.write() = Some(source);
    }

    pub(crate) fn swap(&self, plugins: Vec<PluginDescriptor>) -> RuntimeResult<u64> {
        let count = plugins.len();
        match self.registry.swap(plugins) {
            Ok(generation) => {
                info!(generation, plugins = count, "plugin set swapped");
                Ok(generation)
            }
            Err(e) => {
                warn!(error = %e, "plugin swap rejected");
                Err(e.into())
            }
        }
    }

    pub(crate) async fn refresh(&self) -> RuntimeResult<u64> {
        let source = self
            .source
            .read()
            .clone()
            .ok_or(RuntimeError::NoPluginSource)?;
        let plugins = source.load().await.map_err(|e| {
            warn!(error = %e, "plugin source failed");
            RuntimeError::PluginSource(format!("{e:#}"))
        })?;
        self.swap(plugins)
    }

    async fn apply(&self, request: ReloadRequest) {
        match request {
            ReloadRequest::Swap { plugins, reply } => {
                let _ = reply.send(self.swap(plugins));
            }
            ReloadRequest::Refresh { reply } => {
                let _ = reply.send(self.refresh().await);
            }
        }
    }

    /// Serves requests until `cancel` fires.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let requests = Arc::clone(&self.requests);
        let mut rx = requests.lock().await;
        debug!("reload loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => self.apply(request).await,
                    None => break,
                },
            }
        }
        debug!("reload loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brass_framework::{Outcome, RegistryError, on_message};
    use tokio_test::assert_ok;

    fn plugin(name: &str) -> PluginDescriptor {
        on_message()
            .name(name)
            .handler(|_cx| async { Ok(Outcome::Pass) })
    }

    fn spawn(reloader: &Arc<Reloader>) -> CancellationToken {
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(reloader).run(cancel.clone()));
        cancel
    }

    #[tokio::test]
    async fn test_swap_through_handle() {
        let registry = Arc::new(PluginRegistry::new());
        let reloader = Arc::new(Reloader::new(Arc::clone(&registry)));
        let _cancel = spawn(&reloader);
        let handle = reloader.handle();

        let before = registry.generation();
        let generation = assert_ok!(handle.swap(vec![plugin("a"), plugin("b")]).await);
        assert!(generation > before);
        assert_eq!(registry.names(), vec!["a", "b"]);

        let err = handle.swap(vec![plugin("c"), plugin("c")]).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Registry(RegistryError::DuplicateName { .. })
        ));
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_refresh_uses_source() {
        let registry = Arc::new(PluginRegistry::new());
        let reloader = Arc::new(Reloader::new(Arc::clone(&registry)));
        let _cancel = spawn(&reloader);
        let handle = reloader.handle();

        assert!(matches!(
            handle.refresh().await,
            Err(RuntimeError::NoPluginSource)
        ));

        reloader.set_source(Arc::new(|| async {
            Ok::<_, anyhow::Error>(vec![plugin("fresh")])
        }));
        assert_ok!(handle.refresh().await);
        assert_eq!(registry.names(), vec!["fresh"]);

        reloader.set_source(Arc::new(|| async {
            Err::<Vec<PluginDescriptor>, _>(anyhow::anyhow!("disk on fire"))
        }));
        assert!(matches!(
            handle.refresh().await,
            Err(RuntimeError::PluginSource(msg)) if msg.contains("disk on fire")
        ));
        assert_eq!(registry.names(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_requests_queue_until_loop_runs() {
        let registry = Arc::new(PluginRegistry::new());
        let reloader = Arc::new(Reloader::new(Arc::clone(&registry)));
        let handle = reloader.handle();

        let pending = tokio::spawn(async move { handle.swap(vec![plugin("late")]).await });
        tokio::task::yield_now().await;
        assert!(registry.is_empty());

        let _cancel = spawn(&reloader);
        assert_ok!(assert_ok!(pending.await));
        assert_eq!(registry.names(), vec!["late"]);
    }

    #[tokio::test]
    async fn test_closed_when_reloader_dropped() {
        let registry = Arc::new(PluginRegistry::new());
        let reloader = Arc::new(Reloader::new(registry));
        let handle = reloader.handle();
        drop(reloader);

        assert!(matches!(
            handle.swap(Vec::new()).await,
            Err(RuntimeError::ReloadClosed)
        ));
    }
}
