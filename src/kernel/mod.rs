//! Kernel - the composition root.
//!
//! The Runtime owns one instance of every subsystem and wires them together.
//! Subsystems (plugin manager, service registry, event bus, state mirror, auth)
//! are plain structs shared behind `Arc`, not separate actors: each guards its
//! own state with short-lived `tokio::sync` locks.

mod cleanup;
mod inflight;
pub mod lifecycle;
mod services;
mod types;

pub use cleanup::{CleanupConfig, CleanupService, CleanupStats};
pub use inflight::{InFlightGuard, InFlightTracker};
pub use lifecycle::{BatchReport, PluginManager, StopOutcome, PLUGIN_STATE_TOPIC};
pub use services::{
    service_fn, typed_service, RegistryStats, ServiceHandler, ServiceInfo, ServiceRegistry,
    ServiceRequest, ServiceSpec,
};
pub use types::{PluginInfo, PluginState, StateTransition};

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthService, Credential};
use crate::bus::EventBus;
use crate::plugin::PluginCatalog;
use crate::state::StateMirror;
use crate::storage::StorageAdapter;
use crate::types::{Config, Error, Result};

/// A running kernel instance.
pub struct Runtime {
    config: Config,
    storage: Arc<dyn StorageAdapter>,
    in_flight: Arc<InFlightTracker>,
    bus: Arc<EventBus>,
    services: Arc<ServiceRegistry>,
    state: Arc<StateMirror>,
    auth: Arc<AuthService>,
    plugins: Arc<PluginManager>,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("plugins", &self.plugins)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build every component over `storage`, hydrate the revocation list and
    /// start the background cleanup sweep. No plugins are loaded yet.
    pub async fn boot(config: Config, storage: Arc<dyn StorageAdapter>) -> Result<Arc<Self>> {
        config.validate()?;

        let in_flight = Arc::new(InFlightTracker::new());
        let bus = Arc::new(EventBus::with_tracker(in_flight.clone()));
        let services = Arc::new(ServiceRegistry::with_tracker(in_flight.clone()));
        let state = Arc::new(StateMirror::new(storage.clone()));
        let auth = Arc::new(AuthService::open(&config.auth, storage.clone()).await?);
        let shutdown = CancellationToken::new();
        let plugins = PluginManager::new(
            bus.clone(),
            services.clone(),
            state.clone(),
            shutdown.clone(),
            &config.runtime,
        );

        let cleanup = CleanupService::new(
            auth.clone(),
            CleanupConfig::from(&config.runtime),
            shutdown.child_token(),
        )
        .start();

        tracing::info!(
            revocations = auth.revocations().len().await,
            "runtime_booted"
        );

        Ok(Arc::new(Self {
            config,
            storage,
            in_flight,
            bus,
            services,
            state,
            auth,
            plugins,
            shutdown,
            shut_down: AtomicBool::new(false),
            cleanup: Mutex::new(Some(cleanup)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn state(&self) -> &Arc<StateMirror> {
        &self.state
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn in_flight(&self) -> &Arc<InFlightTracker> {
        &self.in_flight
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Load and start every enabled plugin listed in the configuration.
    ///
    /// An unknown kind fails before anything is loaded. Individual load or
    /// start failures are collected in the report.
    pub async fn load_configured(&self, catalog: &PluginCatalog) -> Result<BatchReport> {
        let descriptors = catalog.descriptors(&self.config.plugins)?;
        let loaded = self.plugins.load_all(descriptors).await;
        let mut report = self.plugins.start_all().await;

        let mut failed = loaded.failed;
        failed.append(&mut report.failed);
        report.failed = failed;
        if !report.is_clean() {
            tracing::warn!(failed = ?report.failed, "some plugins did not start");
        }
        Ok(report)
    }

    /// Entry point for externally triggered calls: authenticate, rate-limit,
    /// authorize against the service's required scopes, then invoke.
    pub async fn call_external(
        &self,
        credential: &Credential,
        service: &str,
        args: Value,
    ) -> Result<Value> {
        if self.shutdown.is_cancelled() {
            return Err(Error::state_transition("runtime is shutting down"));
        }
        let context = self.auth.authenticate(credential).await?;
        tracing::debug!(subject = %context.subject, service, "external_call");
        self.services.call_as(&context, service, args).await
    }

    /// Graceful shutdown.
    ///
    /// Signals the shutdown token, waits up to the grace period for in-flight
    /// calls and deliveries, fails plugins that still own work, then stops
    /// every plugin in reverse start order. Later calls return an empty
    /// report.
    pub async fn shutdown(&self) -> BatchReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return BatchReport::default();
        }

        let grace = self.config.runtime.shutdown_grace;
        tracing::info!(grace = ?grace, in_flight = self.in_flight.total(), "runtime_shutting_down");
        self.shutdown.cancel();

        if !self.in_flight.wait_idle(grace).await {
            for owner in self.in_flight.busy_owners() {
                tracing::warn!(
                    plugin = %owner,
                    in_flight = self.in_flight.count_for(&owner),
                    "in-flight work outlived the shutdown grace period"
                );
                if let Err(e) = self
                    .plugins
                    .mark_failed(&owner, "in-flight work outlived the shutdown grace period")
                    .await
                {
                    tracing::debug!(plugin = %owner, error = %e, "could not mark plugin failed");
                }
            }
        }

        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = cleanup {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "cleanup task ended abnormally");
            }
        }

        let report = self.plugins.stop_all().await;
        tracing::info!(
            stopped = report.succeeded.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "runtime_stopped"
        );
        report
    }
}
