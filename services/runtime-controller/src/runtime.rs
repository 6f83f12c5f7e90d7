//! Runtime backend interface and mock implementation.
//!
//! The backend abstracts the control plane that actually runs cache
//! processes:
//! - Applying a component (master or worker) with a replica count and image
//! - Reading back how many replicas are ready
//! - Deleting a component
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::crd::EngineKind;

/// Backend errors, classified at the engine boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Could not reach the control plane, or it timed out. Retryable.
    #[error("runtime backend unavailable: {0}")]
    Unavailable(String),

    /// The control plane refused the request. Not retryable as-is.
    #[error("runtime backend rejected request: {0}")]
    Rejected(String),
}

/// Component of a cache runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentRole {
    Master,
    Worker,
}

impl ComponentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired shape of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentManifest {
    pub engine: EngineKind,
    pub role: ComponentRole,
    pub image: String,
    pub replicas: i32,
    /// Named ports this component listens on.
    pub ports: BTreeMap<String, u16>,
    pub options: BTreeMap<String, String>,
    /// UID of the owning runtime, used for garbage collection.
    pub owner_uid: Option<String>,
}

impl ComponentManifest {
    /// Digest of everything that shapes the running component.
    ///
    /// The owner UID is left out; it never changes for a live runtime.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.engine.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.role.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.image.as_bytes());
        hasher.update([0]);
        hasher.update(self.replicas.to_be_bytes());
        for (name, port) in &self.ports {
            hasher.update(b"port\0");
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(port.to_be_bytes());
        }
        for (key, value) in &self.options {
            hasher.update(b"option\0");
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        format!("sha256:{}", hex::encode(&digest[..16]))
    }
}

/// Observed state of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentState {
    pub image: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    /// Fingerprint of the manifest last applied, if the component carries one.
    pub fingerprint: Option<String>,
}

/// Runtime control plane interface.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Create or update a component. Idempotent.
    async fn apply_component(
        &self,
        key: &ResourceKey,
        manifest: &ComponentManifest,
    ) -> Result<(), BackendError>;

    /// Observed state of a component, `None` if it does not exist.
    async fn component_status(
        &self,
        key: &ResourceKey,
        role: ComponentRole,
    ) -> Result<Option<ComponentState>, BackendError>;

    /// Delete a component. Returns false if it did not exist.
    async fn delete_component(
        &self,
        key: &ResourceKey,
        role: ComponentRole,
    ) -> Result<bool, BackendError>;
}

struct MockComponent {
    manifest: ComponentManifest,
    polls: u32,
    healthy: bool,
}

/// Mock backend for testing and development.
///
/// Components report all replicas ready once they have been polled more than
/// `ready_after` times. An unhealthy component reports one replica fewer.
pub struct MockBackend {
    components: Mutex<HashMap<(ResourceKey, ComponentRole), MockComponent>>,
    ready_after: AtomicU32,
    unavailable: AtomicBool,
    reject_applies: Mutex<Option<String>>,
    applies: AtomicU64,
}

impl MockBackend {
    /// Create a mock backend whose components become ready on first poll.
    pub fn new() -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            ready_after: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            reject_applies: Mutex::new(None),
            applies: AtomicU64::new(0),
        }
    }

    /// Create a mock backend whose components need `polls` polls before ready.
    pub fn with_ready_after(polls: u32) -> Self {
        let backend = Self::new();
        backend.ready_after.store(polls, Ordering::SeqCst);
        backend
    }

    /// Create a mock backend that rejects every apply.
    pub fn failing(reason: &str) -> Self {
        let backend = Self::new();
        backend.set_rejecting(Some(reason));
        backend
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(ResourceKey, ComponentRole), MockComponent>> {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject applies with a reason, or stop rejecting.
    pub fn set_rejecting(&self, reason: Option<&str>) {
        *self
            .reject_applies
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reason.map(str::to_string);
    }

    /// Fail every call as unreachable until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Toggle health of an existing component.
    pub fn set_healthy(&self, key: &ResourceKey, role: ComponentRole, healthy: bool) {
        if let Some(component) = self.lock().get_mut(&(key.clone(), role)) {
            component.healthy = healthy;
        }
    }

    /// Last applied manifest of a component.
    pub fn component(&self, key: &ResourceKey, role: ComponentRole) -> Option<ComponentManifest> {
        self.lock()
            .get(&(key.clone(), role))
            .map(|c| c.manifest.clone())
    }

    /// Number of components that exist.
    pub fn component_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of successful applies so far.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "mock backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeBackend for MockBackend {
    async fn apply_component(
        &self,
        key: &ResourceKey,
        manifest: &ComponentManifest,
    ) -> Result<(), BackendError> {
        self.check_available()?;
        let rejection = self
            .reject_applies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reason) = rejection {
            return Err(BackendError::Rejected(reason));
        }

        info!(
            key = %key,
            role = %manifest.role,
            image = %manifest.image,
            replicas = manifest.replicas,
            "[MOCK] Applying component"
        );

        let mut components = self.lock();
        let entry = components
            .entry((key.clone(), manifest.role))
            .or_insert_with(|| MockComponent {
                manifest: manifest.clone(),
                polls: 0,
                healthy: true,
            });
        if entry.manifest != *manifest {
            entry.manifest = manifest.clone();
            entry.polls = 0;
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn component_status(
        &self,
        key: &ResourceKey,
        role: ComponentRole,
    ) -> Result<Option<ComponentState>, BackendError> {
        self.check_available()?;
        let ready_after = self.ready_after.load(Ordering::SeqCst);

        let mut components = self.lock();
        let Some(component) = components.get_mut(&(key.clone(), role)) else {
            return Ok(None);
        };
        component.polls = component.polls.saturating_add(1);

        let replicas = component.manifest.replicas;
        let ready_replicas = if component.polls <= ready_after {
            0
        } else if component.healthy {
            replicas
        } else {
            (replicas - 1).max(0)
        };

        debug!(key = %key, role = %role, ready_replicas, replicas, "[MOCK] Component status");

        Ok(Some(ComponentState {
            image: component.manifest.image.clone(),
            replicas,
            ready_replicas,
            fingerprint: Some(component.manifest.fingerprint()),
        }))
    }

    async fn delete_component(
        &self,
        key: &ResourceKey,
        role: ComponentRole,
    ) -> Result<bool, BackendError> {
        self.check_available()?;
        let existed = self.lock().remove(&(key.clone(), role)).is_some();
        if existed {
            info!(key = %key, role = %role, "[MOCK] Deleted component");
        }
        Ok(existed)
    }
}
