//! Service registry - named, single-owner callable endpoints.
//!
//! Features:
//!   - Registration with single-owner names (same owner may replace)
//!   - Typed handler contract with structured input and output
//!   - Scope-gated calls on behalf of an authenticated request
//!   - Per-service call and failure counters
//!
//! The registry imposes no lock around handler execution: concurrent calls to
//! the same name run concurrently, and calls to different names never wait on
//! each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::{RequestContext, Scopes};
use crate::kernel::InFlightTracker;
use crate::types::{Error, Result};

// =============================================================================
// Handler contract
// =============================================================================

/// Input to a service handler.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub args: Value,
    /// Present when the call came from outside the kernel.
    pub context: Option<RequestContext>,
}

impl ServiceRequest {
    pub fn new(args: Value) -> Self {
        Self {
            args,
            context: None,
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Deserialize the arguments, mapping shape errors to `Validation`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| Error::validation(format!("invalid arguments: {}", e)))
    }
}

/// A callable service endpoint.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, request: ServiceRequest) -> Result<Value>;
}

/// Adapter for closures over the raw [`ServiceRequest`].
pub struct FnService<F>(F);

impl<F> std::fmt::Debug for FnService<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnService")
    }
}

#[async_trait]
impl<F, Fut> ServiceHandler for FnService<F>
where
    F: Fn(ServiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, request: ServiceRequest) -> Result<Value> {
        (self.0)(request).await
    }
}

pub fn service_fn<F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(ServiceRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnService(f))
}

/// Adapter for closures with a typed input and output.
pub struct TypedService<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> std::fmt::Debug for TypedService<I, O, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TypedService")
    }
}

#[async_trait]
impl<I, O, F, Fut> ServiceHandler for TypedService<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send,
{
    async fn call(&self, request: ServiceRequest) -> Result<Value> {
        let input: I = request.parse()?;
        let output = (self.f)(input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Wrap a typed closure. Malformed input becomes `Error::Validation` before
/// the closure runs.
pub fn typed_service<I, O, F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    Arc::new(TypedService {
        f,
        _marker: PhantomData,
    })
}

// =============================================================================
// Service descriptors
// =============================================================================

/// What a plugin declares when registering a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub description: String,
    /// Scopes an external caller must hold. Kernel-internal calls skip this.
    pub required_scopes: Scopes,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requires<S: Into<String>>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.required_scopes = scopes.into_iter().collect();
        self
    }
}

/// ServiceInfo describes a registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub required_scopes: Scopes,
    pub registered_at: DateTime<Utc>,
    pub calls: u64,
    pub failures: u64,
}

struct ServiceEntry {
    spec: ServiceSpec,
    owner: String,
    handler: Arc<dyn ServiceHandler>,
    registered_at: DateTime<Utc>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl ServiceEntry {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.spec.name.clone(),
            owner: self.owner.clone(),
            description: self.spec.description.clone(),
            required_scopes: self.spec.required_scopes.clone(),
            registered_at: self.registered_at,
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Overall registry statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub services_by_owner: HashMap<String, usize>,
}

// =============================================================================
// Service Registry
// =============================================================================

/// ServiceRegistry manages service registration, lookup, and dispatch.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    in_flight: Arc<InFlightTracker>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Create a registry with its own in-flight tracker.
    pub fn new() -> Self {
        Self::with_tracker(Arc::new(InFlightTracker::new()))
    }

    /// Create a registry that reports running calls to a shared tracker.
    pub fn with_tracker(in_flight: Arc<InFlightTracker>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            in_flight,
        }
    }

    // =============================================================================
    // Registration
    // =============================================================================

    /// Register `handler` under `name` for `owner`.
    pub async fn register(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
        owner: &str,
    ) -> Result<()> {
        self.register_with(ServiceSpec::new(name), handler, owner)
            .await
    }

    /// Register with a full descriptor.
    ///
    /// Fails with `DuplicateService` if another owner holds the name. The same
    /// owner registering again (e.g. after a restart) replaces the handler.
    pub async fn register_with(
        &self,
        spec: ServiceSpec,
        handler: Arc<dyn ServiceHandler>,
        owner: &str,
    ) -> Result<()> {
        if spec.name.is_empty() || spec.name.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "invalid service name: {:?}",
                spec.name
            )));
        }

        let mut services = self.services.write().await;
        if let Some(existing) = services.get(&spec.name) {
            if existing.owner != owner {
                return Err(Error::duplicate_service(&spec.name, &existing.owner));
            }
            tracing::info!(service = %spec.name, owner, "service_replaced");
        } else {
            tracing::debug!(service = %spec.name, owner, "service_registered");
        }

        let name = spec.name.clone();
        services.insert(
            name,
            Arc::new(ServiceEntry {
                spec,
                owner: owner.to_string(),
                handler,
                registered_at: Utc::now(),
                calls: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        );
        Ok(())
    }

    /// Remove one service. Only its owner may remove it.
    pub async fn unregister(&self, name: &str, owner: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let existing = services
            .get(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))?;
        if existing.owner != owner {
            return Err(Error::forbidden(format!(
                "service {} is owned by {}",
                name, existing.owner
            )));
        }
        services.remove(name);
        tracing::debug!(service = name, owner, "service_unregistered");
        Ok(())
    }

    /// Remove every service owned by `owner`. Returns the removed names, sorted.
    pub async fn unregister_all(&self, owner: &str) -> Vec<String> {
        let mut services = self.services.write().await;
        let mut removed: Vec<String> = services
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            services.remove(name);
        }
        removed.sort();
        if !removed.is_empty() {
            tracing::debug!(owner, count = removed.len(), "owner_services_unregistered");
        }
        removed
    }

    // =============================================================================
    // Dispatch
    // =============================================================================

    async fn lookup(&self, name: &str) -> Result<Arc<ServiceEntry>> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service {}", name)))
    }

    /// Kernel-internal call (plugin to plugin). No scope check.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let entry = self.lookup(name).await?;
        self.invoke(&entry, ServiceRequest::new(args)).await
    }

    /// Call on behalf of an authenticated request. The context must cover the
    /// service's required scopes.
    pub async fn call_as(&self, context: &RequestContext, name: &str, args: Value) -> Result<Value> {
        let entry = self.lookup(name).await?;
        context.authorize(&entry.spec.required_scopes)?;
        self.invoke(&entry, ServiceRequest::new(args).with_context(context.clone()))
            .await
    }

    async fn invoke(&self, entry: &ServiceEntry, request: ServiceRequest) -> Result<Value> {
        let _guard = self.in_flight.enter(Some(&entry.owner));
        entry.calls.fetch_add(1, Ordering::Relaxed);

        let outcome = AssertUnwindSafe(entry.handler.call(request))
            .catch_unwind()
            .await;

        let cause = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => Error::internal("service handler panicked"),
        };

        entry.failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(service = %entry.spec.name, error = %cause, "service_call_failed");
        Err(Error::service(&entry.spec.name, cause))
    }

    // =============================================================================
    // Discovery
    // =============================================================================

    pub async fn get(&self, name: &str) -> Option<ServiceInfo> {
        self.services.read().await.get(name).map(|e| e.info())
    }

    pub async fn has_service(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    /// All services, sorted by name.
    pub async fn list(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<ServiceInfo> = self
            .services
            .read()
            .await
            .values()
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Names owned by `owner`, sorted.
    pub async fn names_for(&self, owner: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .await
            .values()
            .filter(|e| e.owner == owner)
            .map(|e| e.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> RegistryStats {
        let services = self.services.read().await;
        let mut stats = RegistryStats {
            total_services: services.len(),
            ..Default::default()
        };
        for entry in services.values() {
            stats.total_calls += entry.calls.load(Ordering::Relaxed);
            stats.total_failures += entry.failures.load(Ordering::Relaxed);
            *stats
                .services_by_owner
                .entry(entry.owner.clone())
                .or_insert(0) += 1;
        }
        stats
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
