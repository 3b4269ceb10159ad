//! Hub kernel - main entry point.
//!
//! Boots the runtime over the file storage adapter (or memory storage when no
//! data directory is configured), loads the configured plugins and runs
//! until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use hub_core::builtin;
use hub_core::storage::{FileStorage, MemoryStorage, StorageAdapter};
use hub_core::types::PluginConfig;
use hub_core::{Config, Runtime};

#[derive(Debug, Parser)]
#[command(name = "hub-kernel", version, about = "Pluggable automation kernel")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for persisted state and credentials. Overrides the config.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = Some(dir);
    }
    // With no plugins configured, run the built-ins.
    if config.plugins.is_empty() {
        config.plugins = ["system", "state"]
            .into_iter()
            .map(|kind| PluginConfig {
                kind: kind.to_string(),
                name: None,
                enabled: true,
                settings: serde_json::Value::Null,
            })
            .collect();
    }

    hub_core::observability::init_tracing(&config.observability);

    let storage: Arc<dyn StorageAdapter> = match &config.storage.data_dir {
        Some(dir) => {
            tracing::info!(data_dir = %dir.display(), "using file storage");
            Arc::new(FileStorage::open(dir.clone()).await?)
        }
        None => {
            tracing::warn!("no data directory configured, state will not persist");
            Arc::new(MemoryStorage::new())
        }
    };

    let runtime = Runtime::boot(config, storage).await?;
    let report = runtime.load_configured(&builtin::catalog()).await?;
    tracing::info!(
        started = ?report.succeeded,
        failed = report.failed.len(),
        "hub kernel running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    let report = runtime.shutdown().await;
    if !report.is_clean() {
        tracing::warn!(
            failed = ?report.failed,
            abandoned = ?report.abandoned,
            "shutdown finished with problems"
        );
    }
    Ok(())
}
