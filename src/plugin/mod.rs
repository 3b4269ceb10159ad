//! Plugin contract and factory catalog.
//!
//! Plugins are values implementing [`Plugin`], produced by a factory chosen
//! from an explicit [`PluginCatalog`]. Nothing is discovered at runtime.

mod context;

pub use context::PluginContext;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{Error, PluginConfig, Result};

/// An independently loadable unit of behavior.
///
/// `init` and `start` may register services and subscriptions through the
/// context. `stop` should release them; the manager unregisters everything
/// the plugin still owns afterwards regardless.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Implementation name, e.g. `system`. Instance names come from the
    /// descriptor.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    async fn init(&mut self, ctx: PluginContext) -> Result<()>;

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds a plugin from its settings.
pub type PluginFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn Plugin>> + Send + Sync>;

/// What the manager needs to load one plugin instance.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub settings: Value,
    pub factory: PluginFactory,
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, factory: PluginFactory) -> Self {
        Self {
            name: name.into(),
            settings: Value::Null,
            factory,
        }
    }

    /// Descriptor over a closure factory.
    pub fn from_fn<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(factory))
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }
}

/// Maps plugin kinds to factories.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, PluginFactory>,
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the factory for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Descriptor for one configured instance.
    pub fn descriptor(&self, config: &PluginConfig) -> Result<PluginDescriptor> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            Error::config(format!(
                "unknown plugin kind {:?} (known: {})",
                config.kind,
                self.kinds().join(", ")
            ))
        })?;
        Ok(PluginDescriptor::new(config.instance_name(), factory.clone())
            .with_settings(config.settings.clone()))
    }

    /// Descriptors for every enabled entry, in configuration order. An
    /// unknown kind fails the whole list.
    pub fn descriptors(&self, configs: &[PluginConfig]) -> Result<Vec<PluginDescriptor>> {
        configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| self.descriptor(c))
            .collect()
    }
}
