//! In-memory runtime store.
//!
//! Mirrors the API server semantics the controller relies on: resource
//! versions, generation bumps on spec change, deletion held by finalizers,
//! and change notifications. Failure injection hooks let tests exercise the
//! conflict and outage paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{RuntimeStore, StoreError};
use crate::crd::{CacheRuntime, CacheRuntimeSpec};

const WATCH_BUFFER: usize = 1024;

/// Runtime store kept in process memory.
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<ResourceKey, CacheRuntime>>,
    revision: AtomicU64,
    pending_conflicts: AtomicU32,
    unavailable: AtomicBool,
    changes: broadcast::Sender<ResourceKey>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            pending_conflicts: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            changes,
        }
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, key: &ResourceKey) {
        // No subscribers is fine.
        let _ = self.changes.send(key.clone());
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn key_of(runtime: &CacheRuntime) -> Result<ResourceKey, StoreError> {
        runtime
            .key()
            .map_err(|e| StoreError::Invalid(e.to_string()))
    }

    /// Make the next `count` writes fail with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make every call fail with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Create a runtime. Any status on the object is kept as-is.
    pub async fn create(&self, mut runtime: CacheRuntime) -> Result<CacheRuntime, StoreError> {
        let key = Self::key_of(&runtime)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::Invalid(format!("{} already exists", key)));
        }

        let revision = self.next_revision();
        runtime.metadata.uid = Some(format!("uid-{}", revision));
        runtime.metadata.resource_version = Some(revision);
        runtime.metadata.generation = Some(1);
        runtime.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        runtime.metadata.deletion_timestamp = None;

        objects.insert(key.clone(), runtime.clone());
        drop(objects);

        debug!(key = %key, "created runtime");
        self.notify(&key);
        Ok(runtime)
    }

    /// Edit a runtime's spec. The generation moves only if the spec changed.
    pub async fn update_spec<F>(&self, key: &ResourceKey, edit: F) -> Result<CacheRuntime, StoreError>
    where
        F: FnOnce(&mut CacheRuntimeSpec),
    {
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let before = stored.spec.clone();
        edit(&mut stored.spec);
        if stored.spec == before {
            return Ok(stored.clone());
        }

        stored.metadata.generation = Some(stored.generation() + 1);
        stored.metadata.resource_version = Some(self.next_revision());
        let updated = stored.clone();
        drop(objects);

        self.notify(key);
        Ok(updated)
    }

    /// Request deletion. With finalizers present the object stays, marked for
    /// deletion, until the last finalizer is removed.
    pub async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if stored.finalizers().is_empty() {
            objects.remove(key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            stored.metadata.resource_version = Some(self.next_revision());
        } else {
            return Ok(());
        }
        drop(objects);

        self.notify(key);
        Ok(())
    }

    /// Current copy of a runtime, bypassing failure injection.
    pub async fn snapshot(&self, key: &ResourceKey) -> Option<CacheRuntime> {
        self.objects.read().await.get(key).cloned()
    }

    /// Check if a runtime exists.
    pub async fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Validate a write against the stored object and return the stored object.
    fn check_write<'a>(
        &self,
        objects: &'a mut BTreeMap<ResourceKey, CacheRuntime>,
        key: &ResourceKey,
        runtime: &CacheRuntime,
    ) -> Result<&'a mut CacheRuntime, StoreError> {
        let stored = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if self.take_injected_conflict() {
            // Someone else wrote in between.
            stored.metadata.resource_version = Some(self.next_revision());
            return Err(StoreError::Conflict(key.clone()));
        }

        if stored.metadata.resource_version != runtime.metadata.resource_version {
            return Err(StoreError::Conflict(key.clone()));
        }

        Ok(stored)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeStore for InMemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<CacheRuntime, StoreError> {
        self.check_available()?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self) -> Result<Vec<CacheRuntime>, StoreError> {
        self.check_available()?;
        Ok(self.objects.read().await.values().cloned().collect())
    }

    async fn replace_status(&self, runtime: &CacheRuntime) -> Result<CacheRuntime, StoreError> {
        self.check_available()?;
        let key = Self::key_of(runtime)?;
        let mut objects = self.objects.write().await;
        let stored = self.check_write(&mut objects, &key, runtime)?;

        if stored.status == runtime.status {
            return Ok(stored.clone());
        }

        stored.status = runtime.status.clone();
        stored.metadata.resource_version = Some(self.next_revision());
        let updated = stored.clone();
        drop(objects);

        self.notify(&key);
        Ok(updated)
    }

    async fn replace_finalizers(
        &self,
        runtime: &CacheRuntime,
    ) -> Result<CacheRuntime, StoreError> {
        self.check_available()?;
        let key = Self::key_of(runtime)?;
        let mut objects = self.objects.write().await;
        let stored = self.check_write(&mut objects, &key, runtime)?;

        let finalizers = runtime.metadata.finalizers.clone().unwrap_or_default();
        if stored.finalizers() == finalizers.as_slice() {
            return Ok(stored.clone());
        }

        stored.metadata.finalizers = Some(finalizers.clone());
        stored.metadata.resource_version = Some(self.next_revision());
        let updated = stored.clone();

        if updated.is_deleting() && finalizers.is_empty() {
            objects.remove(&key);
            debug!(key = %key, "runtime removed after last finalizer");
        }
        drop(objects);

        self.notify(&key);
        Ok(updated)
    }

    fn watch(&self) -> BoxStream<'static, Result<ResourceKey, StoreError>> {
        BroadcastStream::new(self.changes.subscribe())
            .map(|item| match item {
                Ok(key) => Ok(key),
                Err(BroadcastStreamRecvError::Lagged(missed)) => Err(StoreError::Transient(
                    format!("watch lagged, {} notifications dropped", missed),
                )),
            })
            .boxed()
    }
}
