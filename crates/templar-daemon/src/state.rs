//! Shared server state.
//!
//! One [`ServerState`] is built at startup and shared by every connection
//! task through [`SharedState`]. Everything in it is read-only after
//! construction except the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use templar_core::catalog::Catalog;
use templar_core::compiler::{ContractCompiler, DigestCompiler};
use templar_core::config::{ConfigError, DaemonConfig, ServerConfig};
use templar_core::registry::ReferencePolicy;
use thiserror::Error;
use tokio::sync::watch;

use crate::auth::ExportSigner;
use crate::metrics::SharedMetricsRegistry;
use crate::protocol::dispatch::Dispatcher;
use crate::store::{ContractStore, FileContractStore, StoreError};

/// Errors raised while assembling the server state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The durable store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// State shared by all connections.
pub struct ServerState {
    dispatcher: Dispatcher,
    metrics: SharedMetricsRegistry,
    reference_policy: ReferencePolicy,
    idle_timeout: Duration,
    max_message_bytes: usize,
    shutdown: watch::Sender<bool>,
}

/// Shared reference to the server state.
pub type SharedState = Arc<ServerState>;

impl ServerState {
    /// Assembles the state from parts.
    ///
    /// The dispatcher is wired to `metrics`.
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        metrics: SharedMetricsRegistry,
        server: &ServerConfig,
        reference_policy: ReferencePolicy,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher: dispatcher.with_metrics(Arc::clone(&metrics)),
            metrics,
            reference_policy,
            idle_timeout: server.idle_timeout(),
            max_message_bytes: server.max_message_bytes,
            shutdown,
        }
    }

    /// Builds the state a configuration describes: a digest compiler for the
    /// configured network, a file store if a path is set, and a signer with
    /// the configured or a random key.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth key is invalid or the store directory
    /// cannot be created.
    pub fn from_config(
        config: &DaemonConfig,
        catalog: Arc<Catalog>,
        metrics: SharedMetricsRegistry,
    ) -> Result<Self, StateError> {
        let compiler: Arc<dyn ContractCompiler> =
            Arc::new(DigestCompiler::new(config.compiler.network));
        let signer = match config.auth.key()? {
            Some(key) => ExportSigner::new(key),
            None => {
                tracing::warn!("no auth key configured, signed exports will not survive a restart");
                ExportSigner::generate()
            },
        };

        let mut dispatcher = Dispatcher::new(catalog, compiler, signer);
        if let Some(path) = &config.store.path {
            let store: Arc<dyn ContractStore> = Arc::new(FileContractStore::open(path)?);
            tracing::info!(path = %path.display(), "durable contract store enabled");
            dispatcher = dispatcher.with_store(store);
        }

        Ok(Self::new(
            dispatcher,
            metrics,
            &config.server,
            config.compiler.reference_policy,
        ))
    }

    /// The message dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    /// Reference policy for new sessions.
    #[must_use]
    pub const fn reference_policy(&self) -> ReferencePolicy {
        self.reference_policy
    }

    /// How long a connection may stay silent.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Largest accepted client frame.
    #[must_use]
    pub const fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// A receiver that flips to `true` once shutdown is requested.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Asks every open session to close.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("dispatcher", &self.dispatcher)
            .field("reference_policy", &self.reference_policy)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_message_bytes", &self.max_message_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use templar_core::default_catalog;

    use super::*;
    use crate::metrics::new_shared_registry;

    #[test]
    fn test_from_default_config() {
        let state = ServerState::from_config(
            &DaemonConfig::default(),
            Arc::new(default_catalog().unwrap()),
            new_shared_registry().unwrap(),
        )
        .unwrap();
        assert!(!state.dispatcher().is_durable());
        assert_eq!(state.idle_timeout(), Duration::from_secs(300));
        assert_eq!(state.reference_policy(), ReferencePolicy::Fallback);
    }

    #[test]
    fn test_store_path_enables_durable_saves() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = DaemonConfig::default();
        config.store.path = Some(dir.path().join("store"));
        let state = ServerState::from_config(
            &config,
            Arc::new(default_catalog().unwrap()),
            new_shared_registry().unwrap(),
        )
        .unwrap();
        assert!(state.dispatcher().is_durable());
        assert!(dir.path().join("store").is_dir());
    }

    #[test]
    fn test_shutdown_signal_reaches_subscribers() {
        let state = ServerState::from_config(
            &DaemonConfig::default(),
            Arc::new(default_catalog().unwrap()),
            new_shared_registry().unwrap(),
        )
        .unwrap();
        let signal = state.shutdown_signal();
        assert!(!*signal.borrow());
        state.request_shutdown();
        assert!(*signal.borrow());
        assert!(state.is_shutting_down());
    }
}
