//! Background cleanup for credential records.
//!
//! CleanupService periodically sweeps:
//! - Expired API keys, sessions and refresh tokens (normally deleted lazily
//!   on first access; the sweep catches records nobody presents again)
//! - Idle rate-limit buckets that have refilled to capacity
//!
//! This keeps storage and the limiter bounded in long-running deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthService, PurgeReport};
use crate::types::{Result, RuntimeConfig};

/// Configuration for cleanup behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// How often to run cleanup (default: 5 minutes)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long a full bucket must sit unused before it is dropped
    #[serde(with = "humantime_serde")]
    pub bucket_idle: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for CleanupConfig {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            interval: runtime.cleanup_interval,
            bucket_idle: runtime.cleanup_interval,
        }
    }
}

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub purged: PurgeReport,
    /// When cleanup cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// CleanupService handles background garbage collection.
#[derive(Debug)]
pub struct CleanupService {
    auth: Arc<AuthService>,
    config: CleanupConfig,
    stop: CancellationToken,
}

impl CleanupService {
    /// The loop ends when `stop` is cancelled, either directly or through a
    /// parent token.
    pub fn new(auth: Arc<AuthService>, config: CleanupConfig, stop: CancellationToken) -> Self {
        Self { auth, config, stop }
    }

    /// Start the cleanup loop in the background.
    /// Returns immediately; cleanup runs in a spawned task.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let auth = self.auth.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        tracing::info!("cleanup_service_stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = Self::run_cycle(&auth, &config).await {
                            tracing::error!(error = %e, "cleanup_cycle_failed");
                        }
                    }
                }
            }
        })
    }

    /// Stop the cleanup loop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Run a single cleanup cycle.
    pub async fn run_cycle(auth: &AuthService, config: &CleanupConfig) -> Result<CleanupStats> {
        let purged = auth.purge_expired(Utc::now(), config.bucket_idle).await?;

        tracing::debug!(
            api_keys = purged.api_keys,
            sessions = purged.sessions,
            refresh_tokens = purged.refresh_tokens,
            idle_buckets = purged.idle_buckets,
            "cleanup_cycle_completed"
        );

        Ok(CleanupStats {
            purged,
            completed_at: Some(Utc::now()),
        })
    }
}
