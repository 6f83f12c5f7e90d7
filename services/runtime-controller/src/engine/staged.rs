//! Staged setup shared by every engine variant.
//!
//! A variant is a [`RuntimeProfile`]: which named ports it needs, which images
//! it runs by default, how its spec is validated and which ports it keeps out
//! of allocation. The stages themselves are the same for all of them:
//!
//! 1. Validate the spec
//! 2. Bind the engine kind in status
//! 3. Allocate and persist named ports
//! 4. Apply the master and wait for it
//! 5. Apply the workers and wait for them
//!
//! Every stage reads persisted status or backend state before acting, so a
//! pass that was interrupted anywhere resumes where it stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use cachepilot_networking::PortError;
use tracing::{debug, info, warn};

use super::{Engine, EngineContext, EngineError, EngineFactory, Health, SetupOutcome};
use crate::crd::{CacheRuntime, CacheRuntimeSpec, CacheRuntimeStatus, EngineKind, RuntimePhase};
use crate::runtime::{ComponentManifest, ComponentRole};
use crate::status::update_status;
use crate::store::StoreError;

/// Static description of one engine variant.
pub struct RuntimeProfile {
    pub kind: EngineKind,

    /// Named ports, in allocation order. Names start with the role they belong to.
    pub port_names: &'static [&'static str],

    pub default_master_image: &'static str,
    pub default_worker_image: &'static str,

    /// Engine-specific spec checks. An error is permanent.
    pub validate: fn(&CacheRuntimeSpec) -> Result<(), String>,

    /// Ports to keep out of allocation, given every existing runtime.
    pub reserved_ports: fn(&[CacheRuntime]) -> BTreeSet<u16>,
}

impl RuntimeProfile {
    fn check(&self, spec: &CacheRuntimeSpec) -> Result<(), String> {
        if spec.master.replicas < 0 {
            return Err(format!(
                "master replicas must not be negative, got {}",
                spec.master.replicas
            ));
        }
        if spec.worker.replicas < 0 {
            return Err(format!(
                "worker replicas must not be negative, got {}",
                spec.worker.replicas
            ));
        }
        (self.validate)(spec)
    }

    fn ports_match(&self, recorded: &BTreeMap<String, u16>) -> bool {
        recorded.len() == self.port_names.len()
            && self.port_names.iter().all(|name| recorded.contains_key(*name))
    }
}

impl std::fmt::Debug for RuntimeProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProfile")
            .field("kind", &self.kind)
            .field("port_names", &self.port_names)
            .finish()
    }
}

/// Factory for engines of one profile.
#[derive(Debug, Clone, Copy)]
pub struct StagedFactory {
    profile: &'static RuntimeProfile,
}

impl StagedFactory {
    pub fn new(profile: &'static RuntimeProfile) -> Self {
        Self { profile }
    }

    pub fn shared(profile: &'static RuntimeProfile) -> Arc<dyn EngineFactory> {
        Arc::new(Self::new(profile))
    }
}

impl EngineFactory for StagedFactory {
    fn kind(&self) -> EngineKind {
        self.profile.kind
    }

    fn build(&self, key: &ResourceKey) -> Result<Box<dyn Engine>, EngineError> {
        debug!(key = %key, engine = %self.profile.kind, "Building engine");
        Ok(Box::new(StagedEngine::new(self.profile, key.clone())))
    }

    fn reserved_ports(&self, runtimes: &[CacheRuntime]) -> BTreeSet<u16> {
        (self.profile.reserved_ports)(runtimes)
    }
}

/// Engine instance driving one runtime through the staged setup.
#[derive(Debug)]
pub struct StagedEngine {
    profile: &'static RuntimeProfile,
    key: ResourceKey,
    last_health: Option<Health>,
}

impl StagedEngine {
    pub fn new(profile: &'static RuntimeProfile, key: ResourceKey) -> Self {
        Self {
            profile,
            key,
            last_health: None,
        }
    }

    fn replicas(spec: &CacheRuntimeSpec, role: ComponentRole) -> i32 {
        match role {
            ComponentRole::Master => spec.master.replicas,
            ComponentRole::Worker => spec.worker.replicas,
        }
    }

    fn manifest(
        &self,
        runtime: &CacheRuntime,
        ports: &BTreeMap<String, u16>,
        role: ComponentRole,
    ) -> ComponentManifest {
        let (component, default_image) = match role {
            ComponentRole::Master => (&runtime.spec.master, self.profile.default_master_image),
            ComponentRole::Worker => (&runtime.spec.worker, self.profile.default_worker_image),
        };
        let prefix = format!("{}-", role);

        ComponentManifest {
            engine: self.profile.kind,
            role,
            image: component
                .image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
            replicas: component.replicas,
            ports: ports
                .iter()
                .filter(|(name, _)| name.starts_with(&prefix))
                .map(|(name, port)| (name.clone(), *port))
                .collect(),
            options: runtime.spec.options.clone(),
            owner_uid: runtime.metadata.uid.clone(),
        }
    }

    /// Record the engine kind unless one is bound already. Returns the
    /// current status.
    async fn bind_kind(&self, ctx: &EngineContext) -> Result<CacheRuntimeStatus, EngineError> {
        let kind = self.profile.kind;
        let runtime = update_status(ctx.store.as_ref(), &ctx.key, |status| {
            if status.engine.is_none() {
                status.engine = Some(kind);
            }
        })
        .await?;

        let status = runtime.status_or_default();
        match status.engine {
            Some(bound) if bound != kind => Err(EngineError::Permanent(format!(
                "runtime is bound to engine {}, cannot drive it as {}",
                bound, kind
            ))),
            _ => Ok(status),
        }
    }

    async fn ensure_ports(
        &self,
        ctx: &EngineContext,
        recorded: &BTreeMap<String, u16>,
    ) -> Result<BTreeMap<String, u16>, EngineError> {
        if self.profile.ports_match(recorded) {
            let ports: Vec<u16> = recorded.values().copied().collect();
            match ctx.ports.restore(&ctx.key, &ports) {
                Ok(_) => return Ok(recorded.clone()),
                // Another runtime holds one of our recorded ports; take a new layout.
                Err(PortError::AlreadyHeld { port, holder }) => {
                    warn!(key = %ctx.key, port, holder = %holder, "Recorded port held elsewhere, reallocating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Recorded ports are unusable or belong to another layout; start over.
        let stale = ctx.ports.release(&ctx.key);
        if !stale.is_empty() {
            debug!(key = %ctx.key, ports = ?stale, "Released stale port layout");
        }

        let allocated = ctx.ports.allocate(&ctx.key, self.profile.port_names.len())?;
        let named: BTreeMap<String, u16> = self
            .profile
            .port_names
            .iter()
            .map(|name| name.to_string())
            .zip(allocated.iter().copied())
            .collect();

        let persisted = update_status(ctx.store.as_ref(), &ctx.key, |status| {
            status.ports = named.clone();
        })
        .await;
        if let Err(e) = persisted {
            ctx.ports.release(&ctx.key);
            warn!(key = %ctx.key, error = %e, "Failed to persist allocated ports, released them");
            return Err(e.into());
        }

        info!(key = %ctx.key, ports = ?named, "Allocated ports");
        Ok(named)
    }

    /// Bring one component to its desired shape. Returns the in-progress
    /// reason while it is not there yet.
    ///
    /// Once the runtime has settled (Ready or Degraded at this generation),
    /// readiness is left to `sync_status` and only drift is corrected here.
    async fn converge_component(
        &self,
        ctx: &EngineContext,
        ports: &BTreeMap<String, u16>,
        role: ComponentRole,
        settled: bool,
    ) -> Result<Option<String>, EngineError> {
        let manifest = self.manifest(&ctx.runtime, ports, role);
        if manifest.replicas == 0 {
            if ctx.backend.delete_component(&ctx.key, role).await? {
                info!(key = %ctx.key, role = %role, "Removed component scaled to zero");
            }
            record_ready(ctx, role, 0).await?;
            return Ok(None);
        }

        let fingerprint = manifest.fingerprint();
        let observed = ctx.backend.component_status(&ctx.key, role).await?;
        let state = match observed {
            Some(state) if state.fingerprint.as_deref() == Some(fingerprint.as_str()) => state,
            observed => {
                if observed.is_some() {
                    debug!(key = %ctx.key, role = %role, fingerprint = %fingerprint, "Component drifted from spec");
                }
                ctx.backend.apply_component(&ctx.key, &manifest).await?;
                return Ok(Some(format!("applied {}", role)));
            }
        };
        if settled {
            return Ok(None);
        }

        record_ready(ctx, role, state.ready_replicas).await?;
        if state.ready_replicas < manifest.replicas {
            return Ok(Some(format!(
                "waiting for {}: {}/{} ready",
                role, state.ready_replicas, manifest.replicas
            )));
        }
        Ok(None)
    }
}

async fn record_ready(
    ctx: &EngineContext,
    role: ComponentRole,
    ready: i32,
) -> Result<(), EngineError> {
    update_status(ctx.store.as_ref(), &ctx.key, |status| match role {
        ComponentRole::Master => status.master_ready_replicas = ready,
        ComponentRole::Worker => status.worker_ready_replicas = ready,
    })
    .await?;
    Ok(())
}

#[async_trait]
impl Engine for StagedEngine {
    fn kind(&self) -> EngineKind {
        self.profile.kind
    }

    async fn setup(&mut self, ctx: &EngineContext) -> Result<SetupOutcome, EngineError> {
        ctx.check_cancelled()?;
        self.profile
            .check(&ctx.runtime.spec)
            .map_err(EngineError::Permanent)?;

        let status = self.bind_kind(ctx).await?;
        ctx.check_cancelled()?;

        let ports = self.ensure_ports(ctx, &status.ports).await?;
        let settled = matches!(status.phase, RuntimePhase::Ready | RuntimePhase::Degraded);

        for role in [ComponentRole::Master, ComponentRole::Worker] {
            ctx.check_cancelled()?;
            if let Some(reason) = self.converge_component(ctx, &ports, role, settled).await? {
                debug!(key = %self.key, reason = %reason, "Setup in progress");
                return Ok(SetupOutcome::InProgress(reason));
            }
        }

        Ok(SetupOutcome::Ready)
    }

    async fn sync_status(&mut self, ctx: &EngineContext) -> Result<Health, EngineError> {
        let mut problems = Vec::new();
        let mut ready = [0, 0];

        for (slot, role) in [ComponentRole::Master, ComponentRole::Worker]
            .into_iter()
            .enumerate()
        {
            let desired = Self::replicas(&ctx.runtime.spec, role);
            if desired == 0 {
                continue;
            }
            match ctx.backend.component_status(&ctx.key, role).await? {
                Some(state) => {
                    ready[slot] = state.ready_replicas;
                    if state.ready_replicas < desired {
                        problems.push(format!("{} {}/{} ready", role, state.ready_replicas, desired));
                    }
                }
                None => problems.push(format!("{} missing", role)),
            }
        }

        update_status(ctx.store.as_ref(), &ctx.key, |status| {
            status.master_ready_replicas = ready[0];
            status.worker_ready_replicas = ready[1];
        })
        .await?;

        let health = if problems.is_empty() {
            Health::Healthy
        } else {
            Health::Degraded(problems.join(", "))
        };

        if self.last_health.as_ref() != Some(&health) {
            match &health {
                Health::Healthy => info!(key = %self.key, "Runtime healthy"),
                Health::Degraded(reason) => {
                    warn!(key = %self.key, reason = %reason, "Runtime degraded")
                }
            }
            self.last_health = Some(health.clone());
        }

        Ok(health)
    }

    async fn shutdown(&mut self, ctx: &EngineContext) -> Result<(), EngineError> {
        for role in [ComponentRole::Worker, ComponentRole::Master] {
            if ctx.backend.delete_component(&ctx.key, role).await? {
                info!(key = %self.key, role = %role, "Deleted component");
            }
        }

        let released = ctx.ports.release(&ctx.key);
        if !released.is_empty() {
            info!(key = %self.key, ports = ?released, "Released ports");
        }

        let cleared = update_status(ctx.store.as_ref(), &ctx.key, |status| {
            status.ports.clear();
            status.master_ready_replicas = 0;
            status.worker_ready_replicas = 0;
        })
        .await;
        match cleared {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.last_health = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::alluxio::PROFILE;
    use crate::runtime::MockBackend;
    use crate::store::{InMemoryStore, RuntimeStore};
    use cachepilot_networking::{AllocatePolicy, PortAllocator, PortRange};
    use tokio::sync::watch;

    struct Fixture {
        store: Arc<InMemoryStore>,
        ports: Arc<PortAllocator<ResourceKey>>,
        backend: Arc<MockBackend>,
        key: ResourceKey,
        _shutdown: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    impl Fixture {
        async fn new(spec: CacheRuntimeSpec) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let mut runtime = CacheRuntime::new("imagenet", spec);
            runtime.metadata.namespace = Some("default".to_string());
            store.create(runtime).await.unwrap();

            let range = PortRange::parse("20000-20009").unwrap();
            let (tx, rx) = watch::channel(false);
            Self {
                store,
                ports: Arc::new(PortAllocator::with_policy(range, AllocatePolicy::Bitmap)),
                backend: Arc::new(MockBackend::new()),
                key: ResourceKey::new("default", "imagenet").unwrap(),
                _shutdown: tx,
                shutdown_rx: rx,
            }
        }

        async fn ctx(&self) -> EngineContext {
            EngineContext {
                key: self.key.clone(),
                runtime: Arc::new(self.store.get(&self.key).await.unwrap()),
                store: self.store.clone(),
                ports: self.ports.clone(),
                backend: self.backend.clone(),
                shutdown: self.shutdown_rx.clone(),
                deadline: None,
            }
        }
    }

    #[tokio::test]
    async fn test_setup_stages_until_ready() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());

        let first = engine.setup(&fx.ctx().await).await.unwrap();
        assert_eq!(first, SetupOutcome::InProgress("applied master".to_string()));

        let second = engine.setup(&fx.ctx().await).await.unwrap();
        assert_eq!(second, SetupOutcome::InProgress("applied worker".to_string()));

        let third = engine.setup(&fx.ctx().await).await.unwrap();
        assert_eq!(third, SetupOutcome::Ready);

        let status = fx.store.get(&fx.key).await.unwrap().status.unwrap();
        assert_eq!(status.engine, Some(EngineKind::Alluxio));
        assert_eq!(status.ports.get("master-rpc"), Some(&20000));
        assert_eq!(status.ports.get("worker-rpc"), Some(&20001));
        assert_eq!(status.master_ready_replicas, 1);
        assert_eq!(status.worker_ready_replicas, 1);

        let master = fx.backend.component(&fx.key, ComponentRole::Master).unwrap();
        assert_eq!(master.ports.keys().collect::<Vec<_>>(), vec!["master-rpc"]);
        assert_eq!(master.image, PROFILE.default_master_image);

        // Ready setup is a no-op.
        let applies = fx.backend.apply_count();
        assert_eq!(engine.setup(&fx.ctx().await).await.unwrap(), SetupOutcome::Ready);
        assert_eq!(fx.backend.apply_count(), applies);
        assert_eq!(fx.ports.held_by(&fx.key), vec![20000, 20001]);
    }

    #[tokio::test]
    async fn test_setup_rejects_bound_kind_mismatch() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        update_status(fx.store.as_ref(), &fx.key, |s| {
            s.engine = Some(EngineKind::Juicefs)
        })
        .await
        .unwrap();

        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        let err = engine.setup(&fx.ctx().await).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(fx.ports.held_by(&fx.key).is_empty());
    }

    #[tokio::test]
    async fn test_setup_releases_ports_when_persist_fails() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        let ctx = fx.ctx().await;

        // Bind succeeds, then every port write conflicts.
        let status = engine.bind_kind(&ctx).await.unwrap();
        fx.store.inject_conflicts(crate::status::MAX_CONFLICT_RETRIES + 1);

        let err = engine.ensure_ports(&ctx, &status.ports).await.unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));
        assert!(fx.ports.held_by(&fx.key).is_empty());
        assert_eq!(fx.ports.available(), 10);
    }

    #[tokio::test]
    async fn test_recorded_port_held_elsewhere_moves_layout() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let other = ResourceKey::new("default", "other").unwrap();
        fx.ports.restore(&other, &[20001]).unwrap();

        let recorded = BTreeMap::from([
            ("master-rpc".to_string(), 20001),
            ("worker-rpc".to_string(), 20002),
        ]);
        update_status(fx.store.as_ref(), &fx.key, |s| s.ports = recorded.clone())
            .await
            .unwrap();
        assert_eq!(fx.ports.restore_available(&fx.key, &[20001, 20002]), vec![20001]);

        let engine = StagedEngine::new(&PROFILE, fx.key.clone());
        let ports = engine.ensure_ports(&fx.ctx().await, &recorded).await.unwrap();

        assert_eq!(ports.get("master-rpc"), Some(&20000));
        assert_eq!(ports.get("worker-rpc"), Some(&20002));
        assert_eq!(fx.ports.held_by(&fx.key), vec![20000, 20002]);
        assert_eq!(fx.ports.held_by(&other), vec![20001]);
        let status = fx.store.get(&fx.key).await.unwrap().status.unwrap();
        assert_eq!(status.ports, ports);
    }

    #[tokio::test]
    async fn test_option_change_reapplies_components() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        while engine.setup(&fx.ctx().await).await.unwrap() != SetupOutcome::Ready {}

        fx.store
            .update_spec(&fx.key, |spec| {
                spec.options
                    .insert("alluxio.user.block.size".to_string(), "256MB".to_string());
            })
            .await
            .unwrap();

        assert_eq!(
            engine.setup(&fx.ctx().await).await.unwrap(),
            SetupOutcome::InProgress("applied master".to_string())
        );
        assert_eq!(
            engine.setup(&fx.ctx().await).await.unwrap(),
            SetupOutcome::InProgress("applied worker".to_string())
        );
        assert_eq!(engine.setup(&fx.ctx().await).await.unwrap(), SetupOutcome::Ready);

        let worker = fx.backend.component(&fx.key, ComponentRole::Worker).unwrap();
        assert_eq!(
            worker.options.get("alluxio.user.block.size").map(String::as_str),
            Some("256MB")
        );
    }

    #[tokio::test]
    async fn test_setup_cancelled() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        let mut ctx = fx.ctx().await;
        ctx.deadline = Some(tokio::time::Instant::now());

        assert_eq!(engine.setup(&ctx).await, Err(EngineError::Cancelled));
        assert_eq!(fx.backend.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_status_reports_degraded() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        while engine.setup(&fx.ctx().await).await.unwrap() != SetupOutcome::Ready {}

        assert_eq!(engine.sync_status(&fx.ctx().await).await.unwrap(), Health::Healthy);

        fx.backend.set_healthy(&fx.key, ComponentRole::Worker, false);
        let health = engine.sync_status(&fx.ctx().await).await.unwrap();
        assert_eq!(health, Health::Degraded("worker 0/1 ready".to_string()));
        let status = fx.store.get(&fx.key).await.unwrap().status.unwrap();
        assert_eq!(status.worker_ready_replicas, 0);
    }

    #[tokio::test]
    async fn test_shutdown_twice() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        while engine.setup(&fx.ctx().await).await.unwrap() != SetupOutcome::Ready {}

        engine.shutdown(&fx.ctx().await).await.unwrap();
        engine.shutdown(&fx.ctx().await).await.unwrap();

        assert_eq!(fx.backend.component_count(), 0);
        assert!(fx.ports.held_by(&fx.key).is_empty());
        let status = fx.store.get(&fx.key).await.unwrap().status.unwrap();
        assert!(status.ports.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_setup() {
        let fx = Fixture::new(CacheRuntimeSpec::default()).await;
        let mut engine = StagedEngine::new(&PROFILE, fx.key.clone());
        engine.shutdown(&fx.ctx().await).await.unwrap();
        assert_eq!(fx.ports.available(), 10);
    }
}
