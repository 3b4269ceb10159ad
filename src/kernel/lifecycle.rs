//! Plugin lifecycle management.
//!
//! Implements the plugin state machine:
//! UNLOADED → LOADING → LOADED → STARTING → STARTED → STOPPING → STOPPED,
//! with FAILED reachable from any non-terminal state.
//!
//! Hooks run as spawned tasks bounded by a budget. A hook that exceeds its
//! budget is abandoned, never aborted: the task keeps running detached. The
//! manager never holds its record lock across a hook, so every transition
//! after a hook re-validates the record (it may have been failed or unloaded
//! meanwhile) before committing.
//!
//! Entering a terminal state releases every service and subscription the
//! plugin still owns, under the record lock, before the transition is
//! announced on the bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus};
use crate::plugin::{Plugin, PluginContext, PluginDescriptor};
use crate::state::StateMirror;
use crate::types::{Error, Result, RuntimeConfig};

use super::services::ServiceRegistry;
use super::types::{PluginInfo, PluginState, StateTransition};

/// Topic on which every state transition is announced.
pub const PLUGIN_STATE_TOPIC: &str = "internal.plugin.state_changed";

type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

enum Hook {
    Init(PluginContext),
    Start,
    Stop,
}

impl Hook {
    fn label(&self) -> &'static str {
        match self {
            Hook::Init(_) => "init",
            Hook::Start => "start",
            Hook::Stop => "stop",
        }
    }
}

/// Why a hook did not complete.
enum HookFailure {
    Failed(Error),
    /// Budget exceeded; the task was detached.
    OverBudget(Error),
}

impl HookFailure {
    fn into_error(self) -> Error {
        match self {
            HookFailure::Failed(e) | HookFailure::OverBudget(e) => e,
        }
    }
}

struct PluginRecord {
    kind: String,
    version: String,
    state: PluginState,
    history: Vec<StateTransition>,
    last_error: Option<String>,
    loaded_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    plugin: Option<SharedPlugin>,
    /// Unique per load; also gives load order.
    epoch: u64,
    /// Position in start order, once started.
    start_seq: Option<u64>,
}

impl PluginRecord {
    fn new(epoch: u64) -> Self {
        Self {
            kind: String::new(),
            version: String::new(),
            state: PluginState::Unloaded,
            history: Vec::new(),
            last_error: None,
            loaded_at: Utc::now(),
            started_at: None,
            plugin: None,
            epoch,
            start_seq: None,
        }
    }
}

/// How a single `stop` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    /// The stop hook exceeded its budget; the plugin was force-marked Stopped.
    Abandoned,
    AlreadyTerminal,
}

/// Result of a batch operation. Failures carry their reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Plugins whose stop hook was abandoned.
    pub abandoned: Vec<String>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

/// Plugin manager - owns every plugin record and drives hooks.
pub struct PluginManager {
    me: Weak<PluginManager>,
    records: RwLock<HashMap<String, PluginRecord>>,
    bus: Arc<EventBus>,
    services: Arc<ServiceRegistry>,
    state: Arc<StateMirror>,
    shutdown: CancellationToken,
    start_timeout: Duration,
    stop_timeout: Duration,
    seq: AtomicU64,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("start_timeout", &self.start_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    pub fn new(
        bus: Arc<EventBus>,
        services: Arc<ServiceRegistry>,
        state: Arc<StateMirror>,
        shutdown: CancellationToken,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            records: RwLock::new(HashMap::new()),
            bus,
            services,
            state,
            shutdown,
            start_timeout: config.start_timeout,
            stop_timeout: config.stop_timeout,
            seq: AtomicU64::new(0),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // =============================================================================
    // Transitions
    // =============================================================================

    /// Validate and commit one transition for the incarnation `epoch`.
    async fn transition(
        &self,
        name: &str,
        epoch: u64,
        to: PluginState,
        error: Option<String>,
    ) -> Result<PluginState> {
        let from = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(name)
                .filter(|r| r.epoch == epoch)
                .ok_or_else(|| {
                    Error::state_transition(format!("plugin {} was unloaded or replaced", name))
                })?;

            let from = record.state;
            if !from.can_transition_to(to) {
                return Err(Error::state_transition(format!(
                    "plugin {}: cannot go from {} to {}",
                    name, from, to
                )));
            }

            let now = Utc::now();
            record.state = to;
            record.history.push(StateTransition { from, to, at: now });
            if error.is_some() {
                record.last_error = error;
            }
            if to == PluginState::Started {
                record.started_at = Some(now);
                record.start_seq = Some(self.next_seq());
            }
            if to.is_terminal() {
                self.release(name).await;
            }
            from
        };

        tracing::info!(plugin = name, from = %from, to = %to, "plugin_state_changed");
        self.announce(name, from, to).await;
        Ok(from)
    }

    /// Backstop: remove everything the plugin still owns.
    async fn release(&self, name: &str) {
        let services = self.services.unregister_all(name).await;
        let subscriptions = self.bus.unsubscribe_owner(name).await;
        if !services.is_empty() || subscriptions > 0 {
            tracing::debug!(
                plugin = name,
                services = services.len(),
                subscriptions,
                "plugin_registrations_released"
            );
        }
    }

    async fn announce(&self, name: &str, from: PluginState, to: PluginState) {
        let event = Event::new(
            PLUGIN_STATE_TOPIC,
            json!({ "plugin": name, "from": from, "to": to }),
        )
        .with_source("kernel");
        if let Err(e) = self.bus.publish_event(event).await {
            tracing::warn!(plugin = name, error = %e, "failed to announce state change");
        }
    }

    /// Move to Failed and turn `cause` into a `PluginFailure`.
    async fn fail(&self, name: &str, epoch: u64, cause: Error) -> Error {
        let reason = cause.to_string();
        tracing::error!(plugin = name, error = %reason, "plugin_failed");
        if let Err(e) = self
            .transition(name, epoch, PluginState::Failed, Some(reason.clone()))
            .await
        {
            tracing::debug!(plugin = name, error = %e, "plugin already terminal");
        }
        Error::plugin_failure(name, reason)
    }

    async fn run_hook(
        &self,
        name: &str,
        plugin: SharedPlugin,
        hook: Hook,
        budget: Duration,
    ) -> std::result::Result<(), HookFailure> {
        let label = hook.label();
        let task = tokio::spawn(async move {
            let mut plugin = plugin.lock().await;
            match hook {
                Hook::Init(ctx) => plugin.init(ctx).await,
                Hook::Start => plugin.start().await,
                Hook::Stop => plugin.stop().await,
            }
        });

        // Dropping the JoinHandle on timeout detaches the task.
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result.map_err(HookFailure::Failed),
            Ok(Err(join)) if join.is_panic() => Err(HookFailure::Failed(Error::internal(
                format!("{} hook panicked", label),
            ))),
            Ok(Err(join)) => Err(HookFailure::Failed(Error::internal(format!(
                "{} hook cancelled: {}",
                label, join
            )))),
            Err(_) => Err(HookFailure::OverBudget(Error::timeout(format!(
                "{} hook of plugin {} exceeded {:?}",
                label, name, budget
            )))),
        }
    }

    /// Epoch and instance of a record in one of `expected` states.
    async fn claim(&self, name: &str, expected: &[PluginState]) -> Result<(u64, SharedPlugin)> {
        let records = self.records.read().await;
        let record = records
            .get(name)
            .ok_or_else(|| Error::not_found(format!("plugin {}", name)))?;
        if !expected.contains(&record.state) {
            return Err(Error::state_transition(format!(
                "plugin {} is {}",
                name, record.state
            )));
        }
        let plugin = record
            .plugin
            .clone()
            .ok_or_else(|| Error::internal(format!("plugin {} has no instance", name)))?;
        Ok((record.epoch, plugin))
    }

    // =============================================================================
    // Load / Start
    // =============================================================================

    /// Construct a plugin and run its `init` hook.
    ///
    /// The name must not belong to a non-terminal plugin; a terminal record
    /// under the same name is replaced. Constructor or `init` failure leaves
    /// the record Failed with its registrations rolled back.
    pub async fn load(&self, descriptor: PluginDescriptor) -> Result<()> {
        let PluginDescriptor {
            name,
            settings,
            factory,
        } = descriptor;
        if name.is_empty() {
            return Err(Error::validation("plugin name cannot be empty"));
        }

        let epoch = self.next_seq();
        {
            let mut records = self.records.write().await;
            if let Some(existing) = records.get(&name) {
                if !existing.state.is_terminal() {
                    return Err(Error::validation(format!(
                        "plugin {} is already loaded ({})",
                        name, existing.state
                    )));
                }
            }
            records.insert(name.clone(), PluginRecord::new(epoch));
        }
        self.transition(&name, epoch, PluginState::Loading, None)
            .await?;

        let constructed = std::panic::catch_unwind(AssertUnwindSafe(|| factory(&settings)))
            .unwrap_or_else(|_| Err(Error::internal("plugin constructor panicked")));
        let plugin: SharedPlugin = match constructed {
            Ok(plugin) => Arc::new(Mutex::new(plugin)),
            Err(e) => return Err(self.fail(&name, epoch, e).await),
        };

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&name).filter(|r| r.epoch == epoch) {
                let instance = plugin.lock().await;
                record.kind = instance.name().to_string();
                record.version = instance.version().to_string();
                drop(instance);
                record.plugin = Some(plugin.clone());
            }
        }

        let ctx = PluginContext::new(
            name.clone(),
            epoch,
            settings,
            self.bus.clone(),
            self.services.clone(),
            self.state.clone(),
            self.shutdown.clone(),
            self.me.clone(),
        );
        if let Err(e) = self
            .run_hook(&name, plugin, Hook::Init(ctx), self.start_timeout)
            .await
        {
            return Err(self.fail(&name, epoch, e.into_error()).await);
        }

        self.transition(&name, epoch, PluginState::Loaded, None)
            .await?;
        Ok(())
    }

    /// Load each descriptor in order. One failure never stops the rest.
    pub async fn load_all(&self, descriptors: Vec<PluginDescriptor>) -> BatchReport {
        let mut report = BatchReport::default();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            match self.load(descriptor).await {
                Ok(()) => report.succeeded.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }
        report
    }

    /// Run a loaded plugin's `start` hook within the start budget.
    pub async fn start(&self, name: &str) -> Result<()> {
        let (epoch, plugin) = self.claim(name, &[PluginState::Loaded]).await?;
        self.transition(name, epoch, PluginState::Starting, None)
            .await?;

        match self
            .run_hook(name, plugin, Hook::Start, self.start_timeout)
            .await
        {
            Ok(()) => {
                self.transition(name, epoch, PluginState::Started, None)
                    .await?;
                Ok(())
            }
            Err(e) => Err(self.fail(name, epoch, e.into_error()).await),
        }
    }

    /// Start every Loaded plugin in load order.
    pub async fn start_all(&self) -> BatchReport {
        let names: Vec<String> = self
            .ordered(|r| r.state == PluginState::Loaded)
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let mut report = BatchReport::default();
        for name in names {
            match self.start(&name).await {
                Ok(()) => report.succeeded.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }
        report
    }

    // =============================================================================
    // Stop / Unload
    // =============================================================================

    /// Run a plugin's `stop` hook within the stop budget.
    ///
    /// A hook that exceeds the budget is abandoned and the plugin is
    /// force-marked Stopped. A hook error marks it Failed. Either way every
    /// registration it still owns is removed.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        if self.state(name).await.is_some_and(PluginState::is_terminal) {
            return Ok(StopOutcome::AlreadyTerminal);
        }
        let (epoch, plugin) = self
            .claim(name, &[PluginState::Loaded, PluginState::Started])
            .await?;
        self.transition(name, epoch, PluginState::Stopping, None)
            .await?;

        match self
            .run_hook(name, plugin, Hook::Stop, self.stop_timeout)
            .await
        {
            Ok(()) => {
                self.transition(name, epoch, PluginState::Stopped, None)
                    .await?;
                Ok(StopOutcome::Stopped)
            }
            Err(HookFailure::OverBudget(reason)) => {
                tracing::warn!(
                    plugin = name,
                    budget = ?self.stop_timeout,
                    "stop hook abandoned; it keeps running detached and may leak resources"
                );
                self.transition(name, epoch, PluginState::Stopped, Some(reason.to_string()))
                    .await?;
                Ok(StopOutcome::Abandoned)
            }
            Err(HookFailure::Failed(e)) => Err(self.fail(name, epoch, e).await),
        }
    }

    /// Stop every live plugin: started ones in reverse start order, then
    /// loaded-but-never-started ones in reverse load order.
    pub async fn stop_all(&self) -> BatchReport {
        let mut started: Vec<(String, u64)> = {
            let records = self.records.read().await;
            records
                .iter()
                .filter(|(_, r)| r.state == PluginState::Started)
                .map(|(name, r)| (name.clone(), r.start_seq.unwrap_or(0)))
                .collect()
        };
        started.sort_by(|a, b| b.1.cmp(&a.1));

        let mut loaded = self.ordered(|r| r.state == PluginState::Loaded).await;
        loaded.reverse();

        let names = started
            .into_iter()
            .map(|(name, _)| name)
            .chain(loaded.into_iter().map(|(name, _)| name));

        let mut report = BatchReport::default();
        for name in names {
            match self.stop(&name).await {
                Ok(StopOutcome::Abandoned) => report.abandoned.push(name),
                Ok(_) => report.succeeded.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }
        report
    }

    /// Stop if needed, remove all registrations and forget the record.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let (epoch, state) = {
            let records = self.records.read().await;
            let record = records
                .get(name)
                .ok_or_else(|| Error::not_found(format!("plugin {}", name)))?;
            (record.epoch, record.state)
        };

        match state {
            PluginState::Loaded | PluginState::Started => {
                if let Err(e) = self.stop(name).await {
                    tracing::warn!(plugin = name, error = %e, "stop during unload failed");
                }
            }
            s if s.is_terminal() => {}
            _ => {
                self.fail(name, epoch, Error::internal("unloaded mid-transition"))
                    .await;
            }
        }

        let mut records = self.records.write().await;
        if records.get(name).is_some_and(|r| r.epoch == epoch) {
            records.remove(name);
            self.release(name).await;
            tracing::info!(plugin = name, "plugin_unloaded");
        }
        Ok(())
    }

    /// Force a live plugin into Failed, e.g. when shutdown finds it still
    /// owning in-flight work.
    pub async fn mark_failed(&self, name: &str, reason: &str) -> Result<()> {
        let epoch = self
            .records
            .read()
            .await
            .get(name)
            .map(|r| r.epoch)
            .ok_or_else(|| Error::not_found(format!("plugin {}", name)))?;
        self.transition(name, epoch, PluginState::Failed, Some(reason.to_string()))
            .await?;
        Ok(())
    }

    // =============================================================================
    // Queries
    // =============================================================================

    /// Records matching `filter`, in load order.
    async fn ordered(&self, filter: impl Fn(&PluginRecord) -> bool) -> Vec<(String, PluginState)> {
        let records = self.records.read().await;
        let mut selected: Vec<(&String, &PluginRecord)> =
            records.iter().filter(|(_, r)| filter(r)).collect();
        selected.sort_by_key(|(_, r)| r.epoch);
        selected
            .into_iter()
            .map(|(name, r)| (name.clone(), r.state))
            .collect()
    }

    /// Name → state snapshot in load order.
    pub async fn list(&self) -> Vec<(String, PluginState)> {
        self.ordered(|_| true).await
    }

    pub async fn state(&self, name: &str) -> Option<PluginState> {
        self.records.read().await.get(name).map(|r| r.state)
    }

    /// True if incarnation `epoch` of `name` may still own registrations.
    pub(crate) async fn is_live(&self, name: &str, epoch: u64) -> bool {
        self.records
            .read()
            .await
            .get(name)
            .is_some_and(|r| r.epoch == epoch && r.state.is_live())
    }

    /// Full snapshot of one plugin, including what it currently owns.
    pub async fn info(&self, name: &str) -> Option<PluginInfo> {
        let mut info = {
            let records = self.records.read().await;
            let record = records.get(name)?;
            PluginInfo {
                name: name.to_string(),
                kind: record.kind.clone(),
                version: record.version.clone(),
                state: record.state,
                history: record.history.clone(),
                services: Vec::new(),
                subscriptions: Vec::new(),
                last_error: record.last_error.clone(),
                loaded_at: record.loaded_at,
                started_at: record.started_at,
            }
        };
        info.services = self.services.names_for(name).await;
        info.subscriptions = self
            .bus
            .subscriptions_for(name)
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        Some(info)
    }

    /// Snapshots of every plugin in load order.
    pub async fn infos(&self) -> Vec<PluginInfo> {
        let mut infos = Vec::new();
        for (name, _) in self.list().await {
            if let Some(info) = self.info(&name).await {
                infos.push(info);
            }
        }
        infos
    }

    /// `list()` as a JSON object, for services that expose it.
    pub async fn list_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .list()
            .await
            .into_iter()
            .map(|(name, state)| (name, Value::String(state.to_string())))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use crate::kernel::service_fn;
    use crate::storage::MemoryStorage;
    use crate::types::ErrorKind;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    #[derive(Clone, Default)]
    struct Script {
        init_fails: bool,
        start_fails: bool,
        stop_fails: bool,
        start_delay: Option<Duration>,
        stop_delay: Option<Duration>,
        subscribe: Option<&'static str>,
    }

    struct TestPlugin {
        script: Script,
        log: Log,
        ctx: Option<PluginContext>,
    }

    impl TestPlugin {
        fn note(&self, line: String) {
            self.log.lock().unwrap().push(line);
        }

        fn ctx(&self) -> &PluginContext {
            self.ctx.as_ref().unwrap()
        }
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            "test"
        }

        fn version(&self) -> &str {
            "1.2.3"
        }

        async fn init(&mut self, ctx: PluginContext) -> Result<()> {
            let me = ctx.name().to_string();
            self.note(format!("init {}", me));
            ctx.register_service(
                &format!("{}.ping", me),
                service_fn(|_req| async { Ok(json!("pong")) }),
            )
            .await?;
            if let Some(pattern) = self.script.subscribe {
                let log = self.log.clone();
                let who = me.clone();
                ctx.subscribe(
                    pattern,
                    handler_fn(move |event| {
                        let log = log.clone();
                        let who = who.clone();
                        async move {
                            log.lock()
                                .unwrap()
                                .push(format!("{} got {}", who, event.topic()));
                            Ok(())
                        }
                    }),
                )
                .await?;
            }
            self.ctx = Some(ctx);
            if self.script.init_fails {
                return Err(Error::validation("init boom"));
            }
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            let me = self.ctx().name().to_string();
            self.note(format!("start {}", me));
            if let Some(delay) = self.script.start_delay {
                tokio::time::sleep(delay).await;
            }
            self.ctx()
                .register_service(
                    &format!("{}.started", me),
                    service_fn(|_req| async { Ok(Value::Null) }),
                )
                .await?;
            if self.script.start_fails {
                return Err(Error::internal("start boom"));
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            let me = self.ctx().name().to_string();
            self.note(format!("stop {}", me));
            if let Some(delay) = self.script.stop_delay {
                tokio::time::sleep(delay).await;
            }
            if self.script.stop_fails {
                return Err(Error::internal("stop boom"));
            }
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<PluginManager>,
        services: Arc<ServiceRegistry>,
        bus: Arc<EventBus>,
        log: Log,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = Arc::new(EventBus::new());
            let services = Arc::new(ServiceRegistry::new());
            let state = Arc::new(StateMirror::new(Arc::new(MemoryStorage::new())));
            let config = RuntimeConfig {
                start_timeout: Duration::from_secs(1),
                stop_timeout: Duration::from_secs(1),
                ..RuntimeConfig::default()
            };
            let manager = PluginManager::new(
                bus.clone(),
                services.clone(),
                state,
                CancellationToken::new(),
                &config,
            );
            Self {
                manager,
                services,
                bus,
                log: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn descriptor(&self, name: &str, script: Script) -> PluginDescriptor {
            let log = self.log.clone();
            PluginDescriptor::from_fn(name, move |_settings: &Value| {
                Ok(Box::new(TestPlugin {
                    script: script.clone(),
                    log: log.clone(),
                    ctx: None,
                }) as Box<dyn Plugin>)
            })
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_load_start_stop_happy_path() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        assert_eq!(fx.manager.state("a").await, Some(PluginState::Loaded));
        assert!(fx.services.has_service("a.ping").await);

        fx.manager.start("a").await.unwrap();
        assert_eq!(fx.manager.state("a").await, Some(PluginState::Started));
        assert!(fx.services.has_service("a.started").await);

        assert_eq!(fx.manager.stop("a").await.unwrap(), StopOutcome::Stopped);
        assert_eq!(fx.manager.state("a").await, Some(PluginState::Stopped));
        assert!(!fx.services.has_service("a.ping").await);

        let info = fx.manager.info("a").await.unwrap();
        let states: Vec<PluginState> = info.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                PluginState::Loading,
                PluginState::Loaded,
                PluginState::Starting,
                PluginState::Started,
                PluginState::Stopping,
                PluginState::Stopped,
            ]
        );
        assert_eq!(info.kind, "test");
        assert_eq!(info.version, "1.2.3");
        assert_eq!(fx.log(), vec!["init a", "start a", "stop a"]);
    }

    #[tokio::test]
    async fn test_duplicate_live_name_rejected() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        let err = fx
            .manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(fx.manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_init_failure_rolls_back_and_isolates() {
        let fx = Fixture::new();
        let report = fx
            .manager
            .load_all(vec![
                fx.descriptor(
                    "bad",
                    Script {
                        init_fails: true,
                        subscribe: Some("x.*"),
                        ..Script::default()
                    },
                ),
                fx.descriptor("good", Script::default()),
            ])
            .await;

        assert_eq!(report.succeeded, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(fx.manager.state("bad").await, Some(PluginState::Failed));
        assert!(!fx.services.has_service("bad.ping").await);
        assert!(fx.bus.subscriptions_for("bad").await.is_empty());
        assert!(fx.services.has_service("good.ping").await);

        let info = fx.manager.info("bad").await.unwrap();
        assert!(info.last_error.unwrap().contains("init boom"));
    }

    #[tokio::test]
    async fn test_constructor_failure_marks_failed() {
        let fx = Fixture::new();
        let err = fx
            .manager
            .load(PluginDescriptor::from_fn("broken", |_: &Value| {
                Err(Error::config("missing setting"))
            }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PluginFailure);
        assert_eq!(fx.manager.state("broken").await, Some(PluginState::Failed));
    }

    #[tokio::test]
    async fn test_reload_after_failure() {
        let fx = Fixture::new();
        let _ = fx
            .manager
            .load(fx.descriptor(
                "a",
                Script {
                    init_fails: true,
                    ..Script::default()
                },
            ))
            .await;
        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        assert_eq!(fx.manager.state("a").await, Some(PluginState::Loaded));
        assert!(fx.services.has_service("a.ping").await);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back_everything() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor(
                "a",
                Script {
                    start_fails: true,
                    ..Script::default()
                },
            ))
            .await
            .unwrap();

        let err = fx.manager.start("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PluginFailure);
        assert_eq!(fx.manager.state("a").await, Some(PluginState::Failed));
        // Both the init-time and start-time registrations are gone.
        assert!(!fx.services.has_service("a.ping").await);
        assert!(!fx.services.has_service("a.started").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_blocks_late_registration() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor(
                "slow",
                Script {
                    start_delay: Some(Duration::from_secs(5)),
                    ..Script::default()
                },
            ))
            .await
            .unwrap();

        let err = fx.manager.start("slow").await.unwrap_err();
        assert!(err.to_string().contains("exceeded"));
        assert_eq!(fx.manager.state("slow").await, Some(PluginState::Failed));

        // Let the detached start hook finish; its registration is refused.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fx.services.has_service("slow.started").await);
    }

    #[tokio::test]
    async fn test_start_requires_loaded() {
        let fx = Fixture::new();
        assert_eq!(
            fx.manager.start("ghost").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        fx.manager.start("a").await.unwrap();
        assert_eq!(
            fx.manager.start("a").await.unwrap_err().kind(),
            ErrorKind::StateTransition
        );
    }

    #[tokio::test]
    async fn test_stop_all_reverse_start_order() {
        let fx = Fixture::new();
        for name in ["a", "b", "c"] {
            fx.manager
                .load(fx.descriptor(name, Script::default()))
                .await
                .unwrap();
        }
        fx.manager.start("b").await.unwrap();
        fx.manager.start("a").await.unwrap();
        // "c" stays Loaded.

        let report = fx.manager.stop_all().await;
        assert!(report.is_clean());
        assert_eq!(report.succeeded, vec!["a", "b", "c"]);

        let stops: Vec<String> = fx
            .log()
            .into_iter()
            .filter(|l| l.starts_with("stop"))
            .collect();
        assert_eq!(stops, vec!["stop a", "stop b", "stop c"]);
        assert!(fx.services.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_abandons_and_forces_stopped() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor(
                "hang",
                Script {
                    stop_delay: Some(Duration::from_secs(60)),
                    subscribe: Some("a.*"),
                    ..Script::default()
                },
            ))
            .await
            .unwrap();
        fx.manager.start("hang").await.unwrap();

        let report = fx.manager.stop_all().await;
        assert_eq!(report.abandoned, vec!["hang"]);
        assert_eq!(fx.manager.state("hang").await, Some(PluginState::Stopped));
        assert!(fx.services.names_for("hang").await.is_empty());

        // No handler of a stopped plugin fires.
        fx.bus.publish("a.event", json!({})).await.unwrap();
        assert!(!fx.log().iter().any(|l| l.contains("got a.event")));
    }

    #[tokio::test]
    async fn test_stop_failure_marks_failed() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor(
                "a",
                Script {
                    stop_fails: true,
                    ..Script::default()
                },
            ))
            .await
            .unwrap();
        fx.manager.start("a").await.unwrap();

        let report = fx.manager.stop_all().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(fx.manager.state("a").await, Some(PluginState::Failed));
        assert!(!fx.services.has_service("a.ping").await);
    }

    #[tokio::test]
    async fn test_unload_removes_record_but_not_others_subscriptions() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        fx.manager
            .load(fx.descriptor(
                "b",
                Script {
                    subscribe: Some("a.*"),
                    ..Script::default()
                },
            ))
            .await
            .unwrap();

        fx.manager.unload("a").await.unwrap();
        assert!(fx.manager.state("a").await.is_none());
        assert!(!fx.services.has_service("a.ping").await);

        fx.bus.publish("a.event", json!({})).await.unwrap();
        assert!(fx.log().contains(&"b got a.event".to_string()));
        assert_eq!(
            fx.manager.unload("a").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_mark_failed_releases() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        fx.manager.start("a").await.unwrap();

        fx.manager.mark_failed("a", "stuck handler").await.unwrap();
        let info = fx.manager.info("a").await.unwrap();
        assert_eq!(info.state, PluginState::Failed);
        assert_eq!(info.last_error.as_deref(), Some("stuck handler"));
        assert!(info.services.is_empty());

        // Terminal records cannot fail twice.
        assert!(fx.manager.mark_failed("a", "again").await.is_err());
    }

    #[tokio::test]
    async fn test_transitions_are_announced() {
        let fx = Fixture::new();
        let seen: Log = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        fx.bus
            .subscribe(
                PLUGIN_STATE_TOPIC,
                handler_fn(move |event| {
                    let sink = sink.clone();
                    async move {
                        let p = event.payload();
                        sink.lock().unwrap().push(format!(
                            "{}:{}->{}",
                            p["plugin"].as_str().unwrap_or_default(),
                            p["from"].as_str().unwrap_or_default(),
                            p["to"].as_str().unwrap_or_default()
                        ));
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        fx.manager.start("a").await.unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![
                "a:unloaded->loading",
                "a:loading->loaded",
                "a:loaded->starting",
                "a:starting->started",
            ]
        );
    }

    #[tokio::test]
    async fn test_list_json() {
        let fx = Fixture::new();
        fx.manager
            .load(fx.descriptor("a", Script::default()))
            .await
            .unwrap();
        assert_eq!(fx.manager.list_json().await, json!({"a": "loaded"}));
    }
}
