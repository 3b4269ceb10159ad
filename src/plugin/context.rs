//! Per-plugin handle onto the kernel.
//!
//! Everything registered through a context is attributed to the plugin, so the
//! manager can roll it back on failure and remove it on stop or unload.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, EventHandler, PublishReport, Subscription};
use crate::kernel::{PluginManager, ServiceHandler, ServiceRegistry, ServiceSpec};
use crate::state::StateMirror;
use crate::types::{Error, Result};

#[derive(Clone)]
pub struct PluginContext {
    name: String,
    /// Identifies this incarnation when a name is reloaded.
    epoch: u64,
    settings: Value,
    bus: Arc<EventBus>,
    services: Arc<ServiceRegistry>,
    state: Arc<StateMirror>,
    shutdown: CancellationToken,
    manager: Weak<PluginManager>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        epoch: u64,
        settings: Value,
        bus: Arc<EventBus>,
        services: Arc<ServiceRegistry>,
        state: Arc<StateMirror>,
        shutdown: CancellationToken,
        manager: Weak<PluginManager>,
    ) -> Self {
        Self {
            name,
            epoch,
            settings,
            bus,
            services,
            state,
            shutdown,
            manager,
        }
    }

    /// Instance name; also the owner of everything registered here.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Deserialize the instance settings. `null` settings parse as `T::default()`.
    pub fn parse_settings<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.settings.clone()).map_err(|e| {
            Error::validation(format!("invalid settings for plugin {}: {}", self.name, e))
        })
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

    /// Cancelled when the runtime begins shutting down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The manager, while the runtime is alive.
    pub fn plugins(&self) -> Option<Arc<PluginManager>> {
        self.manager.upgrade()
    }

    async fn is_live(&self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.is_live(&self.name, self.epoch).await,
            None => false,
        }
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.is_live().await {
            Ok(())
        } else {
            Err(Error::state_transition(format!(
                "plugin {} is not live and cannot register",
                self.name
            )))
        }
    }

    // =============================================================================
    // Registration
    // =============================================================================

    pub async fn register_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<()> {
        self.register(ServiceSpec::new(name), handler).await
    }

    /// Register a service owned by this plugin.
    ///
    /// Fails once the plugin has reached a terminal state, so a hook that
    /// outlived its budget cannot leave handlers behind.
    pub async fn register(
        &self,
        spec: ServiceSpec,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<()> {
        self.ensure_live().await?;
        let name = spec.name.clone();
        self.services.register_with(spec, handler, &self.name).await?;

        // The plugin may have failed while the registry lock was awaited.
        if !self.is_live().await {
            if let Err(e) = self.services.unregister(&name, &self.name).await {
                tracing::debug!(
                    plugin = %self.name,
                    service = %name,
                    error = %e,
                    "late registration already removed"
                );
            }
            return Err(Error::state_transition(format!(
                "plugin {} stopped during registration of {}",
                self.name, name
            )));
        }
        Ok(())
    }

    /// Subscribe a handler owned by this plugin.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        self.ensure_live().await?;
        let subscription = self
            .bus
            .subscribe_owned(&self.name, pattern, handler)
            .await?;

        if !self.is_live().await {
            self.bus.unsubscribe(&subscription).await;
            return Err(Error::state_transition(format!(
                "plugin {} stopped during subscription to {}",
                self.name, pattern
            )));
        }
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.bus.unsubscribe(subscription).await
    }

    // =============================================================================
    // Interaction
    // =============================================================================

    /// Publish with this plugin as the event source.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishReport> {
        self.bus
            .publish_event(Event::new(topic, payload).with_source(&self.name))
            .await
    }

    /// Call another plugin's service.
    pub async fn call(&self, service: &str, args: Value) -> Result<Value> {
        self.services.call(service, args).await
    }
}
