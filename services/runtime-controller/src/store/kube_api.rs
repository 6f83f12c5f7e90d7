//! Runtime store backed by the Kubernetes API server.

use std::sync::Arc;

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{RuntimeStore, StoreError};
use crate::crd::CacheRuntime;
use crate::kube_backend::{LABEL_RUNTIME, MANAGED_BY_SELECTOR};
use crate::throttle::ApiThrottle;

/// Runtime store talking to the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    throttle: Arc<ApiThrottle>,
}

impl KubeStore {
    pub fn new(client: Client, throttle: Arc<ApiThrottle>) -> Self {
        Self { client, throttle }
    }

    fn api(&self, namespace: &str) -> Api<CacheRuntime> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Classify an API error for a given object.
pub(crate) fn classify(key: &ResourceKey, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(e) if e.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(e) if e.code == 409 => StoreError::Conflict(key.clone()),
        kube::Error::Api(e) if e.code == 400 || e.code == 422 => StoreError::Invalid(e.message),
        other => StoreError::Transient(other.to_string()),
    }
}

fn key_of(runtime: &CacheRuntime) -> Result<ResourceKey, StoreError> {
    runtime
        .key()
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

/// Owning runtime of a managed StatefulSet, from its labels.
fn owner_key(set: &StatefulSet) -> Option<ResourceKey> {
    let runtime = set.labels().get(LABEL_RUNTIME)?;
    ResourceKey::new(set.namespace()?, runtime.as_str()).ok()
}

#[async_trait]
impl RuntimeStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<CacheRuntime, StoreError> {
        self.throttle.acquire().await;
        self.api(key.namespace())
            .get_opt(key.name())
            .await
            .map_err(|e| classify(key, e))?
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self) -> Result<Vec<CacheRuntime>, StoreError> {
        let api: Api<CacheRuntime> = Api::all(self.client.clone());
        self.throttle.acquire().await;
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(list.items)
    }

    async fn replace_status(&self, runtime: &CacheRuntime) -> Result<CacheRuntime, StoreError> {
        let key = key_of(runtime)?;
        let body = serde_json::to_vec(runtime).map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.throttle.acquire().await;
        self.api(key.namespace())
            .replace_status(key.name(), &PostParams::default(), body)
            .await
            .map_err(|e| classify(&key, e))
    }

    async fn replace_finalizers(
        &self,
        runtime: &CacheRuntime,
    ) -> Result<CacheRuntime, StoreError> {
        let key = key_of(runtime)?;
        self.throttle.acquire().await;
        self.api(key.namespace())
            .replace(key.name(), &PostParams::default(), runtime)
            .await
            .map_err(|e| classify(&key, e))
    }

    fn watch(&self) -> BoxStream<'static, Result<ResourceKey, StoreError>> {
        let runtimes = watcher(
            Api::<CacheRuntime>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .touched_objects()
        .map(|item| match item {
            Ok(runtime) => key_of(&runtime),
            Err(e) => Err(StoreError::Transient(e.to_string())),
        });

        let sets = watcher(
            Api::<StatefulSet>::all(self.client.clone()),
            watcher::Config::default().labels(MANAGED_BY_SELECTOR),
        )
        .default_backoff()
        .touched_objects()
        .filter_map(|item| async move {
            match item {
                Ok(set) => {
                    let key = owner_key(&set);
                    if key.is_none() {
                        debug!(statefulset = %set.name_any(), "managed statefulset without runtime label");
                    }
                    key.map(Ok)
                }
                Err(e) => Some(Err(StoreError::Transient(e.to_string()))),
            }
        });

        stream::select(runtimes, sets).boxed()
    }
}
