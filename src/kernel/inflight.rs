//! In-flight work accounting.
//!
//! Service calls and event deliveries hold an [`InFlightGuard`] for as long as
//! the handler runs. Shutdown uses the tracker to wait for a bounded grace
//! period and to find the plugins that still own unfinished work afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-owner counters of running handlers.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    by_owner: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    idle: Notify,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn owners_map(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // Counters stay meaningful even if a holder panicked mid-update.
        self.by_owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark one unit of work as started. Work without an owner is counted in
    /// the total only.
    pub fn enter(self: &Arc<Self>, owner: Option<&str>) -> InFlightGuard {
        self.total.fetch_add(1, Ordering::SeqCst);
        if let Some(owner) = owner {
            *self.owners_map().entry(owner.to_string()).or_insert(0) += 1;
        }
        InFlightGuard {
            tracker: Arc::clone(self),
            owner: owner.map(str::to_string),
        }
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// In-flight count attributed to one owner.
    pub fn count_for(&self, owner: &str) -> usize {
        self.owners_map().get(owner).copied().unwrap_or(0)
    }

    /// Owners with unfinished work, sorted.
    pub fn busy_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .owners_map()
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(owner, _)| owner.clone())
            .collect();
        owners.sort();
        owners
    }

    /// Wait until nothing is in flight or `grace` elapses.
    ///
    /// Returns `true` if the tracker drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            if self.total() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.total() == 0;
            }
        }
    }

    fn exit(&self, owner: Option<&str>) {
        if let Some(owner) = owner {
            let mut map = self.owners_map();
            if let Some(count) = map.get_mut(owner) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(owner);
                }
            }
        }
        if self.total.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// RAII marker for one running handler.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    owner: Option<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.exit(self.owner.as_deref());
    }
}
