//! `state` plugin: the State Mirror exposed as services.
//!
//! `state.set` and `state.delete` persist first, then announce the change on
//! `internal.state_changed`. The announcement is best-effort: once the write
//! succeeded the call succeeds even if publishing fails.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::kernel::{typed_service, ServiceSpec};
use crate::plugin::{Plugin, PluginContext};
use crate::state::StateMirror;
use crate::types::{Error, Result};

pub const KIND: &str = "state";

/// Topic announcing a write through this plugin.
pub const STATE_CHANGED_TOPIC: &str = "internal.state_changed";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// Namespace used when a call omits one.
    pub default_namespace: String,
    /// Namespaces loaded into the mirror on start.
    pub hydrate: Vec<String>,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            hydrate: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyArgs {
    namespace: Option<String>,
    key: String,
}

#[derive(Debug, Deserialize)]
struct SetArgs {
    namespace: Option<String>,
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct NamespaceArgs {
    namespace: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetReply {
    value: Option<Value>,
    generation: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SetReply {
    generation: u64,
}

/// Shared by every handler of one plugin instance.
#[derive(Debug, Clone)]
struct Store {
    default_namespace: Arc<str>,
    state: Arc<StateMirror>,
    bus: Arc<EventBus>,
    source: Arc<str>,
}

impl Store {
    fn namespace(&self, requested: Option<String>) -> Result<String> {
        let namespace = requested.unwrap_or_else(|| self.default_namespace.to_string());
        if namespace.is_empty() {
            return Err(Error::validation("namespace cannot be empty"));
        }
        Ok(namespace)
    }

    async fn announce(&self, payload: Value) {
        let event = crate::bus::Event::new(STATE_CHANGED_TOPIC, payload).with_source(&*self.source);
        if let Err(e) = self.bus.publish_event(event).await {
            tracing::warn!(error = %e, "state change written but not announced");
        }
    }
}

#[derive(Debug)]
pub struct StatePlugin {
    settings: StateSettings,
    ctx: Option<PluginContext>,
}

impl StatePlugin {
    pub fn new(settings: StateSettings) -> Self {
        Self {
            settings,
            ctx: None,
        }
    }
}

#[async_trait]
impl Plugin for StatePlugin {
    fn name(&self) -> &str {
        KIND
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn init(&mut self, ctx: PluginContext) -> Result<()> {
        let store = Store {
            default_namespace: self.settings.default_namespace.as_str().into(),
            state: ctx.state().clone(),
            bus: ctx.bus().clone(),
            source: ctx.name().into(),
        };

        let s = store.clone();
        ctx.register(
            ServiceSpec::new("state.get").describe("Read one key").requires(["state:read"]),
            typed_service(move |args: KeyArgs| {
                let s = s.clone();
                async move {
                    let namespace = s.namespace(args.namespace)?;
                    let entry = s.state.entry(&namespace, &args.key).await?;
                    Ok::<_, Error>(GetReply {
                        generation: entry.as_ref().map(|e| e.generation),
                        value: entry.map(|e| e.value),
                    })
                }
            }),
        )
        .await?;

        let s = store.clone();
        ctx.register(
            ServiceSpec::new("state.set").describe("Write one key").requires(["state:write"]),
            typed_service(move |args: SetArgs| {
                let s = s.clone();
                async move {
                    let namespace = s.namespace(args.namespace)?;
                    let generation = s.state.set(&namespace, &args.key, args.value).await?;
                    s.announce(json!({
                        "namespace": namespace,
                        "key": args.key,
                        "generation": generation,
                    }))
                    .await;
                    Ok::<_, Error>(SetReply { generation })
                }
            }),
        )
        .await?;

        let s = store.clone();
        ctx.register(
            ServiceSpec::new("state.delete").describe("Delete one key").requires(["state:write"]),
            typed_service(move |args: KeyArgs| {
                let s = s.clone();
                async move {
                    let namespace = s.namespace(args.namespace)?;
                    s.state.delete(&namespace, &args.key).await?;
                    s.announce(json!({
                        "namespace": namespace,
                        "key": args.key,
                        "deleted": true,
                    }))
                    .await;
                    Ok::<_, Error>(Value::Null)
                }
            }),
        )
        .await?;

        let s = store;
        ctx.register(
            ServiceSpec::new("state.keys").describe("List keys in a namespace").requires(["state:read"]),
            typed_service(move |args: NamespaceArgs| {
                let s = s.clone();
                async move {
                    let namespace = s.namespace(args.namespace)?;
                    s.state.keys(&namespace).await
                }
            }),
        )
        .await?;

        self.ctx = Some(ctx);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let Some(ctx) = &self.ctx else {
            return Err(Error::internal("state plugin started before init"));
        };
        for namespace in &self.settings.hydrate {
            let loaded = ctx.state().hydrate(namespace).await?;
            tracing::info!(namespace = %namespace, keys = loaded, "state namespace hydrated");
        }
        Ok(())
    }
}

pub fn factory(settings: &Value) -> Result<Box<dyn Plugin>> {
    let settings: StateSettings = if settings.is_null() {
        StateSettings::default()
    } else {
        serde_json::from_value(settings.clone())
            .map_err(|e| Error::config(format!("invalid state plugin settings: {}", e)))?
    };
    Ok(Box::new(StatePlugin::new(settings)))
}
