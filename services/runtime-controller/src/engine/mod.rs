//! Engine contract and the catalog of engine kinds.
//!
//! An engine drives one runtime of one technology through setup, steady-state
//! status sync and teardown. Engines are built by factories held in an
//! [`EngineCatalog`], an immutable table assembled once at startup.
//!
//! ## Error classes
//!
//! Low-level store, backend and allocator errors are classified here, at the
//! engine boundary. The dispatcher only ever sees [`EngineError`].

mod alluxio;
mod juicefs;
mod staged;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use cachepilot_networking::{PortAllocator, PortError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::crd::{CacheRuntime, EngineKind};
use crate::runtime::{BackendError, RuntimeBackend};
use crate::store::{RuntimeStore, StoreError};

pub use staged::{RuntimeProfile, StagedEngine, StagedFactory};

/// Result of one setup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Every component is up.
    Ready,
    /// More steps remain; the reason says which.
    InProgress(String),
}

/// Runtime health reported by `sync_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Classified engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// I/O or timeout; retry with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid configuration or unrecoverable failure; stop until the spec changes.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Not enough free ports in the configured range. Retried with backoff.
    #[error("port range exhausted: requested {requested}, available {available}")]
    PortsExhausted { requested: usize, available: usize },

    /// Process shutdown or per-call deadline. Retried with backoff.
    #[error("cancelled")]
    Cancelled,

    /// The runtime was deleted while the call ran. Not a failure.
    #[error("runtime gone: {0}")]
    Gone(String),
}

impl EngineError {
    /// Returns true if the error will not go away by retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(key) => Self::Gone(key.to_string()),
            StoreError::Invalid(msg) => Self::Permanent(msg),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unavailable(msg) => Self::Transient(msg),
            BackendError::Rejected(msg) => Self::Permanent(msg),
        }
    }
}

impl From<PortError> for EngineError {
    fn from(error: PortError) -> Self {
        match error {
            PortError::ExhaustedRange {
                requested,
                available,
                ..
            } => Self::PortsExhausted {
                requested,
                available,
            },
            PortError::AlreadyHeld { .. } => Self::Transient(error.to_string()),
            other => Self::Permanent(other.to_string()),
        }
    }
}

/// Everything an engine call may touch.
pub struct EngineContext {
    pub key: ResourceKey,
    /// Snapshot of the runtime at the start of this reconciliation.
    pub runtime: Arc<CacheRuntime>,
    pub store: Arc<dyn RuntimeStore>,
    pub ports: Arc<PortAllocator<ResourceKey>>,
    pub backend: Arc<dyn RuntimeBackend>,
    /// Process shutdown signal.
    pub shutdown: watch::Receiver<bool>,
    /// Optional per-call deadline.
    pub deadline: Option<Instant>,
}

impl EngineContext {
    /// Returns true on shutdown or once the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `Cancelled` if the call should stop.
    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// One engine instance, bound to one runtime.
#[async_trait]
pub trait Engine: Send {
    /// Technology this engine drives.
    fn kind(&self) -> EngineKind;

    /// Drive the runtime toward running. Idempotent; resumes from persisted progress.
    async fn setup(&mut self, ctx: &EngineContext) -> Result<SetupOutcome, EngineError>;

    /// Read live health and record it in status. Never changes topology.
    async fn sync_status(&mut self, ctx: &EngineContext) -> Result<Health, EngineError>;

    /// Tear down whatever exists and release ports. Safe to call repeatedly.
    async fn shutdown(&mut self, ctx: &EngineContext) -> Result<(), EngineError>;
}

/// Builds engines of one kind.
pub trait EngineFactory: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Build a fresh engine for a runtime.
    fn build(&self, key: &ResourceKey) -> Result<Box<dyn Engine>, EngineError>;

    /// Ports this kind needs kept out of allocation, given the existing runtimes.
    fn reserved_ports(&self, _runtimes: &[CacheRuntime]) -> BTreeSet<u16> {
        BTreeSet::new()
    }
}

/// Immutable table of engine factories by kind.
#[derive(Clone, Default)]
pub struct EngineCatalog {
    factories: BTreeMap<EngineKind, Arc<dyn EngineFactory>>,
}

impl EngineCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in engine.
    pub fn builtin() -> Self {
        Self::new()
            .with(alluxio::factory())
            .with(juicefs::factory())
    }

    /// Add a factory, replacing any previous one of the same kind.
    pub fn with(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factories.insert(factory.kind(), factory);
        self
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn EngineFactory>> {
        self.factories.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        self.factories.keys().copied().collect()
    }

    /// Union of every factory's reserved ports.
    pub fn reserved_ports(&self, runtimes: &[CacheRuntime]) -> BTreeSet<u16> {
        self.factories
            .values()
            .flat_map(|factory| factory.reserved_ports(runtimes))
            .collect()
    }
}

impl std::fmt::Debug for EngineCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}
