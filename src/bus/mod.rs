//! Event bus for in-process publish/subscribe.
//!
//! Plugins never call each other directly; notifications flow through the bus:
//!   - Handlers subscribe with an exact topic or a `prefix.*` pattern
//!   - `publish` delivers to every matching subscription in registration order
//!   - A failing or panicking handler is logged and skipped; delivery to the
//!     remaining subscribers and the publisher are unaffected
//!
//! `publish` returns once every matching handler for that call has been
//! invoked. No lock is held while a handler runs, so handlers may publish,
//! subscribe or unsubscribe themselves.

mod pattern;

pub use pattern::{validate_topic, TopicPattern};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::kernel::InFlightTracker;
use crate::types::{Result, SubscriptionId};

// =============================================================================
// Event
// =============================================================================

/// Immutable notification. Handlers receive it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    topic: String,
    payload: Value,
    timestamp: DateTime<Utc>,
    source: Option<String>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Attribute the event to a plugin or subsystem.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Subscriber callback.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// =============================================================================
// Subscriptions
// =============================================================================

struct SubscriptionEntry {
    id: SubscriptionId,
    pattern: TopicPattern,
    owner: Option<String>,
    handler: Arc<dyn EventHandler>,
    /// Cleared on unsubscribe so an in-progress publish skips the handler.
    active: AtomicBool,
}

impl SubscriptionEntry {
    fn receipt(&self) -> Subscription {
        Subscription {
            id: self.id.clone(),
            pattern: self.pattern.clone(),
            owner: self.owner.clone(),
        }
    }
}

/// Subscription receipt for managing subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: TopicPattern,
    pub owner: Option<String>,
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub active_subscriptions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    events_published: AtomicU64,
    deliveries: AtomicU64,
    handler_failures: AtomicU64,
}

// =============================================================================
// EventBus
// =============================================================================

/// In-memory publish/subscribe bus.
pub struct EventBus {
    /// Registration order is delivery order.
    subscriptions: RwLock<Vec<Arc<SubscriptionEntry>>>,
    in_flight: Arc<InFlightTracker>,
    counters: Counters,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus with its own in-flight tracker.
    pub fn new() -> Self {
        Self::with_tracker(Arc::new(InFlightTracker::new()))
    }

    /// Create a bus that reports running handlers to a shared tracker.
    pub fn with_tracker(in_flight: Arc<InFlightTracker>) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            in_flight,
            counters: Counters::default(),
        }
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish `payload` under `topic` to every matching subscriber.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishReport> {
        self.publish_event(Event::new(topic, payload)).await
    }

    /// Publish a pre-built event.
    ///
    /// Fails only if the topic itself is invalid; handler failures are
    /// reported in the returned [`PublishReport`].
    pub async fn publish_event(&self, event: Event) -> Result<PublishReport> {
        validate_topic(event.topic())?;
        let event = Arc::new(event);

        let targets: Vec<Arc<SubscriptionEntry>> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|entry| entry.pattern.matches(event.topic()))
            .cloned()
            .collect();

        let mut report = PublishReport::default();
        for entry in targets {
            // The subscriber may have been removed while an earlier handler ran.
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }

            let _guard = self.in_flight.enter(entry.owner.as_deref());
            let outcome = AssertUnwindSafe(entry.handler.handle(Arc::clone(&event)))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(
                        topic = event.topic(),
                        subscription = %entry.id,
                        owner = entry.owner.as_deref().unwrap_or("-"),
                        error = %e,
                        "event_handler_failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(
                        topic = event.topic(),
                        subscription = %entry.id,
                        owner = entry.owner.as_deref().unwrap_or("-"),
                        "event_handler_panicked"
                    );
                }
            }
        }

        self.counters.events_published.fetch_add(1, Ordering::Relaxed);
        self.counters
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .handler_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        tracing::debug!(
            topic = event.topic(),
            delivered = report.delivered,
            failed = report.failed,
            "event_published"
        );

        Ok(report)
    }

    // =========================================================================
    // Subscribe / Unsubscribe
    // =========================================================================

    /// Subscribe a kernel-internal handler (no owning plugin).
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        self.insert(None, pattern, handler).await
    }

    /// Subscribe on behalf of a plugin so the manager can remove it later.
    pub async fn subscribe_owned(
        &self,
        owner: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        self.insert(Some(owner.to_string()), pattern, handler).await
    }

    async fn insert(
        &self,
        owner: Option<String>,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        let pattern = TopicPattern::parse(pattern)?;
        let entry = Arc::new(SubscriptionEntry {
            id: SubscriptionId::new(),
            pattern,
            owner,
            handler,
            active: AtomicBool::new(true),
        });
        let receipt = entry.receipt();

        self.subscriptions.write().await.push(entry);

        tracing::debug!(
            subscription = %receipt.id,
            pattern = %receipt.pattern,
            owner = receipt.owner.as_deref().unwrap_or("-"),
            "subscribed"
        );
        Ok(receipt)
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.unsubscribe_id(&subscription.id).await
    }

    pub async fn unsubscribe_id(&self, id: &SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|entry| {
            if &entry.id == id {
                entry.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        let removed = subscriptions.len() != before;
        if removed {
            tracing::debug!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Remove every subscription owned by `owner`. Returns how many were removed.
    ///
    /// After this returns, none of the owner's handlers will be invoked again,
    /// including by publishes already in progress.
    pub async fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|entry| {
            if entry.owner.as_deref() == Some(owner) {
                entry.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        let removed = before - subscriptions.len();
        if removed > 0 {
            tracing::debug!(owner, removed, "owner_unsubscribed");
        }
        removed
    }

    /// Subscriptions owned by `owner`, in registration order.
    pub async fn subscriptions_for(&self, owner: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|entry| entry.owner.as_deref() == Some(owner))
            .map(|entry| entry.receipt())
            .collect()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub async fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            active_subscriptions: self.subscriptions.read().await.len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;
    use serde_json::json;
    use std::sync::Mutex;

    /// Handler that appends `label` to a shared log for every event.
    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> Arc<dyn EventHandler> {
        let log = log.clone();
        let label = label.to_string();
        handler_fn(move |event: Arc<Event>| {
            let log = log.clone();
            let label = label.clone();
            async move {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}", label, event.topic()));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_to_zero_subscribers() {
        let bus = EventBus::new();

        let report = bus.publish("test.event", json!({})).await.unwrap();
        assert_eq!(report, PublishReport::default());

        let stats = bus.stats().await;
        assert_eq!(stats.events_published, 1);
    }

    #[tokio::test]
    async fn test_wildcard_and_exact_delivered_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("external.*", recorder(&log, "wild"))
            .await
            .unwrap();
        bus.subscribe("external.device_discovered", recorder(&log, "exact"))
            .await
            .unwrap();
        bus.subscribe("internal.*", recorder(&log, "other"))
            .await
            .unwrap();

        let report = bus
            .publish("external.device_discovered", json!({"id": "lamp-1"}))
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "wild:external.device_discovered",
                "exact:external.device_discovered"
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "a.*",
            handler_fn(|_event: Arc<Event>| async { Err::<(), _>(Error::internal("boom")) }),
        )
        .await
        .unwrap();
        bus.subscribe("a.*", recorder(&log, "after")).await.unwrap();

        let report = bus.publish("a.event", json!(null)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after:a.event"]);
        assert_eq!(bus.stats().await.handler_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "a.event",
            handler_fn(|_event: Arc<Event>| async {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            }),
        )
        .await
        .unwrap();
        bus.subscribe("a.event", recorder(&log, "survivor"))
            .await
            .unwrap();

        let report = bus.publish("a.event", json!(1)).await.unwrap();
        assert_eq!(report, PublishReport { delivered: 1, failed: 1 });
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sub = bus
            .subscribe("test.event", recorder(&log, "x"))
            .await
            .unwrap();
        assert_eq!(bus.stats().await.active_subscriptions, 1);

        assert!(bus.unsubscribe(&sub).await);
        assert!(!bus.unsubscribe(&sub).await);
        assert_eq!(bus.stats().await.active_subscriptions, 0);

        let report = bus.publish("test.event", json!({})).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_owner_is_complete() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_owned("b", "a.*", recorder(&log, "b1"))
            .await
            .unwrap();
        bus.subscribe_owned("b", "a.event", recorder(&log, "b2"))
            .await
            .unwrap();
        bus.subscribe_owned("c", "a.*", recorder(&log, "c"))
            .await
            .unwrap();

        assert_eq!(bus.subscriptions_for("b").await.len(), 2);
        assert_eq!(bus.unsubscribe_owner("b").await, 2);
        assert!(bus.subscriptions_for("b").await.is_empty());

        bus.publish("a.event", json!({})).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["c:a.event"]);
    }

    #[tokio::test]
    async fn test_handler_removed_mid_publish_is_skipped() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        // First handler removes the second subscriber's owner before it runs.
        let bus_for_handler = Arc::downgrade(&bus);
        bus.subscribe(
            "a.event",
            handler_fn(move |_event: Arc<Event>| {
                let bus = bus_for_handler.clone();
                async move {
                    if let Some(bus) = bus.upgrade() {
                        bus.unsubscribe_owner("victim").await;
                    }
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
        bus.subscribe_owned("victim", "a.event", recorder(&log, "victim"))
            .await
            .unwrap();

        let report = bus.publish("a.event", json!({})).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_subscriber_once_per_publish() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("a.*", recorder(&log, "x")).await.unwrap();

        bus.publish("a.one", json!({})).await.unwrap();
        bus.publish("a.two", json!({})).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["x:a.one", "x:a.two"]);
    }

    #[tokio::test]
    async fn test_invalid_topics_and_patterns() {
        let bus = EventBus::new();
        assert!(bus.publish("", json!({})).await.is_err());
        assert!(bus.publish("a.*", json!({})).await.is_err());

        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(bus.subscribe("*.a", recorder(&log, "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_event_carries_source_and_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = seen.clone();
        bus.subscribe(
            "devices.*",
            handler_fn(move |event: Arc<Event>| {
                let seen = seen_in_handler.clone();
                async move {
                    *seen.lock().unwrap() = Some((*event).clone());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish_event(Event::new("devices.added", json!({"id": 7})).with_source("devices"))
            .await
            .unwrap();

        let event = seen.lock().unwrap().clone().unwrap();
        assert_eq!(event.topic(), "devices.added");
        assert_eq!(event.payload()["id"], 7);
        assert_eq!(event.source(), Some("devices"));
    }
}
