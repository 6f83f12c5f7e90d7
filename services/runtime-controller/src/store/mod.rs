//! Object store seam for `CacheRuntime` resources.
//!
//! The store is strongly consistent and uses optimistic concurrency: every
//! write carries the resource version it was based on, and a stale write
//! fails with [`StoreError::Conflict`] instead of overwriting.
//!
//! - `KubeStore`: the Kubernetes API server
//! - `InMemoryStore`: a local store with the same semantics, for tests

mod kube_api;
mod memory;

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::crd::CacheRuntime;

pub use kube_api::KubeStore;
pub use memory::InMemoryStore;

/// Object store errors, already classified.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{0} not found")]
    NotFound(ResourceKey),

    /// The write was based on a stale resource version.
    #[error("conflict writing {0}: object was modified")]
    Conflict(ResourceKey),

    /// The store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Transient(String),

    /// The store rejected the object.
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Read and write access to runtime resources, plus change notifications.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Fetch one runtime.
    async fn get(&self, key: &ResourceKey) -> Result<CacheRuntime, StoreError>;

    /// List runtimes in all namespaces.
    async fn list(&self) -> Result<Vec<CacheRuntime>, StoreError>;

    /// Write `runtime.status`, guarded by `runtime.metadata.resource_version`.
    async fn replace_status(&self, runtime: &CacheRuntime) -> Result<CacheRuntime, StoreError>;

    /// Write `runtime.metadata.finalizers`, guarded by the resource version.
    async fn replace_finalizers(&self, runtime: &CacheRuntime)
        -> Result<CacheRuntime, StoreError>;

    /// Stream of runtime keys that changed (the runtime itself or an owned object).
    fn watch(&self) -> BoxStream<'static, Result<ResourceKey, StoreError>>;
}
