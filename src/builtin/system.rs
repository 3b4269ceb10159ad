//! `system` plugin: kernel introspection services.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::kernel::{service_fn, ServiceRequest, ServiceSpec};
use crate::plugin::{Plugin, PluginContext};
use crate::types::{Error, Result};

pub const KIND: &str = "system";

#[derive(Debug, Default)]
pub struct SystemPlugin;

impl SystemPlugin {
    pub fn new() -> Self {
        Self
    }
}

/// External callers must be admins. Kernel-internal calls carry no context
/// and pass.
fn require_admin(request: &ServiceRequest) -> Result<()> {
    match &request.context {
        Some(ctx) if !ctx.is_admin => Err(Error::forbidden(format!(
            "{} is not an administrator",
            ctx.subject
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        KIND
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn init(&mut self, ctx: PluginContext) -> Result<()> {
        ctx.register(
            ServiceSpec::new("system.ping").describe("Liveness check"),
            service_fn(|_req| async { Ok(json!({ "pong": true, "time": Utc::now() })) }),
        )
        .await?;

        let plugins_ctx = ctx.clone();
        ctx.register(
            ServiceSpec::new("system.plugins").describe("Plugin states and ownership (admin only)"),
            service_fn(move |req| {
                let ctx = plugins_ctx.clone();
                async move {
                    require_admin(&req)?;
                    let manager = ctx
                        .plugins()
                        .ok_or_else(|| Error::internal("plugin manager is gone"))?;
                    Ok::<_, Error>(serde_json::to_value(manager.infos().await)?)
                }
            }),
        )
        .await?;

        let services = ctx.services().clone();
        ctx.register(
            ServiceSpec::new("system.services").describe("Registered services with counters"),
            service_fn(move |_req| {
                let services = services.clone();
                async move { Ok::<_, Error>(serde_json::to_value(services.list().await)?) }
            }),
        )
        .await?;

        tracing::debug!(plugin = ctx.name(), "system services registered");
        Ok(())
    }
}

/// Factory for the catalog. The plugin takes no settings.
pub fn factory(_settings: &Value) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(SystemPlugin::new()))
}
