//! Reconcile Dispatcher: one pass of the runtime state machine.
//!
//! ```text
//! Unseen -> Initializing -> SettingUp -> Ready <-> Degraded
//!                                 \          \        |
//!                                  +-> Failed  +-> Terminating -> Gone
//! ```
//!
//! Every transition is persisted in `status.phase` before the next step runs,
//! so a fresh process resumes from whatever the last successful write said.
//! The dispatcher only sees classified errors: [`EngineError`] from engines
//! and [`StoreError`] from its own status writes.

use std::sync::Arc;
use std::time::Duration;

use cachepilot_id::ResourceKey;
use cachepilot_networking::PortAllocator;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{CacheRuntime, EngineKind, RuntimePhase, CONDITION_READY};
use crate::engine::{EngineContext, EngineError, Health, SetupOutcome};
use crate::events::{EventRecorder, EventType};
use crate::registry::{EngineHandle, EngineRegistry};
use crate::runtime::RuntimeBackend;
use crate::status::{add_finalizer, remove_finalizer, update_status};
use crate::store::{RuntimeStore, StoreError};

/// What the scheduler should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; wait for the next change.
    Done,
    /// Converged; look again after the period.
    Resync(Duration),
    /// Not converged or failed transiently; retry with backoff.
    Backoff,
    /// Failed permanently; wait for a spec change.
    Halted,
    /// The runtime no longer exists.
    Gone,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Engine for runtimes that name none.
    pub default_engine: EngineKind,

    /// Re-sync period for runtimes that do not set their own. Zero disables it.
    pub resync_period: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_engine: EngineKind::Alluxio,
            resync_period: Duration::from_secs(30),
        }
    }
}

/// Drives runtimes through their lifecycle.
pub struct Dispatcher {
    store: Arc<dyn RuntimeStore>,
    registry: Arc<EngineRegistry>,
    ports: Arc<PortAllocator<ResourceKey>>,
    backend: Arc<dyn RuntimeBackend>,
    events: Arc<dyn EventRecorder>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RuntimeStore>,
        registry: Arc<EngineRegistry>,
        ports: Arc<PortAllocator<ResourceKey>>,
        backend: Arc<dyn RuntimeBackend>,
        events: Arc<dyn EventRecorder>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            ports,
            backend,
            events,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Run one reconciliation pass for `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(
        &self,
        key: &ResourceKey,
        shutdown: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Outcome {
        let runtime = match self.store.get(key).await {
            Ok(runtime) => Arc::new(runtime),
            Err(StoreError::NotFound(_)) => {
                debug!("Runtime not found, treating as gone");
                self.forget(key);
                return Outcome::Gone;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load runtime");
                return Outcome::Backoff;
            }
        };

        if runtime.is_deleting() {
            return self.terminate(key, runtime, shutdown, deadline).await;
        }

        let status = runtime.status_or_default();
        let generation = runtime.generation();

        if status.phase == RuntimePhase::Failed && status.observed_generation == Some(generation) {
            debug!(generation, "Runtime failed at this generation, waiting for a spec change");
            return Outcome::Halted;
        }

        if !runtime.has_finalizer() {
            match add_finalizer(self.store.as_ref(), key).await {
                Ok(_) => debug!("Added finalizer"),
                Err(e) => return self.store_failure(key, "add finalizer", e),
            }
        }

        if status.observed_generation != Some(generation) {
            let written = update_status(self.store.as_ref(), key, |s| {
                s.phase = RuntimePhase::SettingUp;
                s.observed_generation = Some(generation);
                s.set_condition(CONDITION_READY, false, "SettingUp", "setting up runtime");
            })
            .await;
            if let Err(e) = written {
                return self.store_failure(key, "record generation", e);
            }
            info!(generation, from = %status.phase, "Setting up runtime");
        }

        let kind = EngineRegistry::infer_engine_kind(
            runtime.status.as_ref(),
            runtime.spec.engine.unwrap_or(self.config.default_engine),
        );
        let engine = match self.registry.resolve(key, kind).await {
            Ok(engine) => engine,
            Err(e) => return self.engine_failure(key, &runtime, e).await,
        };

        let ctx = self.context(key, runtime.clone(), shutdown, deadline);
        let setup = engine.lock().await.setup(&ctx).await;
        match setup {
            Ok(SetupOutcome::Ready) => self.sync(key, &runtime, &engine, &ctx).await,
            Ok(SetupOutcome::InProgress(reason)) => {
                debug!(reason = %reason, "Setup in progress");
                let written = update_status(self.store.as_ref(), key, |s| {
                    s.phase = RuntimePhase::SettingUp;
                    s.set_condition(CONDITION_READY, false, "SettingUp", &reason);
                })
                .await;
                if let Err(e) = written {
                    return self.store_failure(key, "record progress", e);
                }
                Outcome::Backoff
            }
            Err(e) => self.engine_failure(key, &runtime, e).await,
        }
    }

    fn context(
        &self,
        key: &ResourceKey,
        runtime: Arc<CacheRuntime>,
        shutdown: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> EngineContext {
        EngineContext {
            key: key.clone(),
            runtime,
            store: self.store.clone(),
            ports: self.ports.clone(),
            backend: self.backend.clone(),
            shutdown,
            deadline,
        }
    }

    /// Steady state: read health, record Ready or Degraded.
    async fn sync(
        &self,
        key: &ResourceKey,
        runtime: &CacheRuntime,
        engine: &EngineHandle,
        ctx: &EngineContext,
    ) -> Outcome {
        let synced = engine.lock().await.sync_status(ctx).await;
        let health = match synced {
            Ok(health) => health,
            Err(e) => return self.engine_failure(key, runtime, e).await,
        };

        let (phase, ready, reason, message) = match &health {
            Health::Healthy => (RuntimePhase::Ready, true, "Ready", "all components ready".to_string()),
            Health::Degraded(why) => (RuntimePhase::Degraded, false, "Degraded", why.clone()),
        };

        let previous = runtime.status_or_default().phase;
        let written = update_status(self.store.as_ref(), key, |s| {
            s.phase = phase;
            s.set_condition(CONDITION_READY, ready, reason, &message);
        })
        .await;
        if let Err(e) = written {
            return self.store_failure(key, "record health", e);
        }

        if previous != phase {
            info!(from = %previous, to = %phase, "Runtime phase changed");
            let type_ = if health.is_healthy() {
                EventType::Normal
            } else {
                EventType::Warning
            };
            self.events.publish(runtime, type_, reason, &message).await;
        }

        let period = runtime
            .spec
            .resync_period_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.resync_period);
        if period.is_zero() {
            Outcome::Done
        } else {
            Outcome::Resync(period)
        }
    }

    /// Deletion requested: tear down, then let the object go.
    async fn terminate(
        &self,
        key: &ResourceKey,
        runtime: Arc<CacheRuntime>,
        shutdown: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Outcome {
        if !runtime.has_finalizer() {
            self.forget(key);
            return Outcome::Gone;
        }

        let written = update_status(self.store.as_ref(), key, |s| {
            s.phase = RuntimePhase::Terminating;
            s.set_condition(CONDITION_READY, false, "Terminating", "runtime is being deleted");
        })
        .await;
        if let Err(e) = written {
            return self.store_failure(key, "record termination", e);
        }

        let kind = EngineRegistry::infer_engine_kind(
            runtime.status.as_ref(),
            runtime.spec.engine.unwrap_or(self.config.default_engine),
        );
        match self.registry.resolve(key, kind).await {
            Ok(engine) => {
                let ctx = self.context(key, runtime.clone(), shutdown, deadline);
                let result = engine.lock().await.shutdown(&ctx).await;
                if let Err(EngineError::Gone(_)) = result {
                    self.forget(key);
                    return Outcome::Gone;
                }
                if let Err(e) = result {
                    warn!(error = %e, "Teardown failed, will retry");
                    self.events
                        .publish(&runtime, EventType::Warning, "TeardownFailed", &e.to_string())
                        .await;
                    return Outcome::Backoff;
                }
            }
            Err(e) => {
                // Components are owned by the runtime and collected with it.
                warn!(error = %e, "No engine for teardown, releasing ports only");
            }
        }

        if let Err(e) = remove_finalizer(self.store.as_ref(), key).await {
            return self.store_failure(key, "remove finalizer", e);
        }
        self.forget(key);

        info!("Runtime terminated");
        Outcome::Gone
    }

    fn forget(&self, key: &ResourceKey) {
        self.registry.remove(key);
        let released = self.ports.release(key);
        if !released.is_empty() {
            info!(key = %key, ports = ?released, "Released ports of removed runtime");
        }
    }

    fn store_failure(&self, key: &ResourceKey, action: &str, error: StoreError) -> Outcome {
        if error.is_not_found() {
            self.forget(key);
            return Outcome::Gone;
        }
        warn!(action, error = %error, "Status write failed, will retry");
        Outcome::Backoff
    }

    async fn engine_failure(
        &self,
        key: &ResourceKey,
        runtime: &CacheRuntime,
        error: EngineError,
    ) -> Outcome {
        match error {
            EngineError::Gone(_) => {
                debug!("Runtime disappeared during reconciliation");
                self.forget(key);
                Outcome::Gone
            }
            EngineError::Cancelled => {
                debug!("Reconciliation cancelled");
                Outcome::Backoff
            }
            EngineError::PortsExhausted {
                requested,
                available,
            } => {
                warn!(
                    requested,
                    available,
                    range = %self.ports.range(),
                    "Port range exhausted; runtime cannot start until ports free up or the range grows"
                );
                self.events
                    .publish(runtime, EventType::Warning, "PortsExhausted", &error.to_string())
                    .await;
                Outcome::Backoff
            }
            EngineError::Transient(ref reason) => {
                warn!(reason = %reason, "Transient engine error, will retry");
                self.events
                    .publish(runtime, EventType::Warning, "ReconcileError", reason)
                    .await;
                Outcome::Backoff
            }
            EngineError::Permanent(ref reason) => {
                error!(reason = %reason, "Permanent engine error, halting until the spec changes");
                let generation = runtime.generation();
                let written = update_status(self.store.as_ref(), key, |s| {
                    s.phase = RuntimePhase::Failed;
                    s.observed_generation = Some(generation);
                    s.set_condition(CONDITION_READY, false, "Failed", reason);
                })
                .await;
                if let Err(e) = written {
                    return self.store_failure(key, "record failure", e);
                }
                self.events
                    .publish(runtime, EventType::Warning, "SetupFailed", reason)
                    .await;
                Outcome::Halted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CacheRuntimeSpec;
    use crate::engine::EngineCatalog;
    use crate::events::MemoryRecorder;
    use crate::runtime::MockBackend;
    use crate::store::InMemoryStore;
    use cachepilot_networking::{AllocatePolicy, PortRange};

    struct Harness {
        store: Arc<InMemoryStore>,
        backend: Arc<MockBackend>,
        events: Arc<MemoryRecorder>,
        ports: Arc<PortAllocator<ResourceKey>>,
        dispatcher: Dispatcher,
        shutdown: watch::Receiver<bool>,
        _tx: watch::Sender<bool>,
    }

    fn harness(range: &str) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let events = Arc::new(MemoryRecorder::new());
        let ports = Arc::new(PortAllocator::with_policy(
            PortRange::parse(range).unwrap(),
            AllocatePolicy::Bitmap,
        ));
        let registry = Arc::new(EngineRegistry::new(Arc::new(EngineCatalog::builtin())));
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            ports.clone(),
            backend.clone(),
            events.clone(),
            DispatcherConfig::default(),
        );
        let (tx, rx) = watch::channel(false);
        Harness {
            store,
            backend,
            events,
            ports,
            dispatcher,
            shutdown: rx,
            _tx: tx,
        }
    }

    impl Harness {
        async fn create(&self, name: &str, spec: CacheRuntimeSpec) -> ResourceKey {
            let mut runtime = CacheRuntime::new(name, spec);
            runtime.metadata.namespace = Some("default".to_string());
            self.store.create(runtime).await.unwrap();
            ResourceKey::new("default", name).unwrap()
        }

        async fn pass(&self, key: &ResourceKey) -> Outcome {
            self.dispatcher.reconcile(key, self.shutdown.clone(), None).await
        }

        async fn phase(&self, key: &ResourceKey) -> RuntimePhase {
            self.store
                .snapshot(key)
                .await
                .unwrap()
                .status_or_default()
                .phase
        }
    }

    #[tokio::test]
    async fn test_missing_runtime_is_gone() {
        let h = harness("20000-20009");
        let key = ResourceKey::new("default", "missing").unwrap();
        assert_eq!(h.pass(&key).await, Outcome::Gone);
    }

    #[tokio::test]
    async fn test_runtime_vanishing_mid_setup_is_gone() {
        let h = harness("20000-20009");
        let key = h.create("imagenet", CacheRuntimeSpec::default()).await;
        assert_eq!(h.pass(&key).await, Outcome::Backoff);
        let runtime = h.store.snapshot(&key).await.unwrap();
        assert_eq!(h.ports.held_by(&key).len(), 2);

        let vanished = EngineError::from(StoreError::NotFound(key.clone()));
        assert_eq!(vanished, EngineError::Gone("default/imagenet".to_string()));

        let outcome = h.dispatcher.engine_failure(&key, &runtime, vanished).await;
        assert_eq!(outcome, Outcome::Gone);
        assert!(h.ports.held_by(&key).is_empty());
        assert!(!h.dispatcher.registry().contains(&key));
        assert!(h.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_converges_to_ready() {
        let h = harness("20000-20009");
        let key = h.create("imagenet", CacheRuntimeSpec::default()).await;

        assert_eq!(h.pass(&key).await, Outcome::Backoff);
        assert_eq!(h.phase(&key).await, RuntimePhase::SettingUp);
        assert!(h.store.snapshot(&key).await.unwrap().has_finalizer());

        assert_eq!(h.pass(&key).await, Outcome::Backoff);
        assert_eq!(
            h.pass(&key).await,
            Outcome::Resync(Duration::from_secs(30))
        );
        assert_eq!(h.phase(&key).await, RuntimePhase::Ready);
        assert_eq!(h.events.reasons(), vec!["Ready"]);
    }

    #[tokio::test]
    async fn test_invalid_spec_halts() {
        let h = harness("20000-20009");
        let mut spec = CacheRuntimeSpec::default();
        spec.master.replicas = 2;
        let key = h.create("even", spec).await;

        assert_eq!(h.pass(&key).await, Outcome::Halted);
        assert_eq!(h.phase(&key).await, RuntimePhase::Failed);
        assert_eq!(h.pass(&key).await, Outcome::Halted);
        assert_eq!(h.events.reasons(), vec!["SetupFailed"]);
        assert_eq!(h.backend.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_ports_exhausted_backs_off() {
        let h = harness("20000");
        let key = h.create("imagenet", CacheRuntimeSpec::default()).await;

        assert_eq!(h.pass(&key).await, Outcome::Backoff);
        assert_eq!(h.events.reasons(), vec!["PortsExhausted"]);
        assert_eq!(h.phase(&key).await, RuntimePhase::SettingUp);
        assert_eq!(h.ports.available(), 1);
    }

    #[tokio::test]
    async fn test_resync_disabled_per_runtime() {
        let h = harness("20000-20009");
        let spec = CacheRuntimeSpec {
            resync_period_seconds: Some(0),
            ..Default::default()
        };
        let key = h.create("imagenet", spec).await;

        let mut outcome = h.pass(&key).await;
        while outcome == Outcome::Backoff {
            outcome = h.pass(&key).await;
        }
        assert_eq!(outcome, Outcome::Done);
    }

    #[tokio::test]
    async fn test_degraded_and_recovered() {
        let h = harness("20000-20009");
        let key = h.create("imagenet", CacheRuntimeSpec::default()).await;
        while h.pass(&key).await == Outcome::Backoff {}

        h.backend
            .set_healthy(&key, crate::runtime::ComponentRole::Worker, false);
        h.pass(&key).await;
        assert_eq!(h.phase(&key).await, RuntimePhase::Degraded);

        h.backend
            .set_healthy(&key, crate::runtime::ComponentRole::Worker, true);
        h.pass(&key).await;
        assert_eq!(h.phase(&key).await, RuntimePhase::Ready);
        assert_eq!(h.events.reasons(), vec!["Ready", "Degraded", "Ready"]);
    }

    #[tokio::test]
    async fn test_backend_outage_is_transient() {
        let h = harness("20000-20009");
        let key = h.create("imagenet", CacheRuntimeSpec::default()).await;
        h.backend.set_unavailable(true);

        assert_eq!(h.pass(&key).await, Outcome::Backoff);
        assert_eq!(h.events.reasons(), vec!["ReconcileError"]);
        assert_ne!(h.phase(&key).await, RuntimePhase::Failed);
    }
}
