//! Runtime backend that renders components as StatefulSets.
//!
//! Each component becomes one StatefulSet named `<runtime>-<role>`, owned by
//! the `CacheRuntime` so the API server garbage-collects it if the runtime
//! disappears without teardown. Readiness comes from `status.readyReplicas`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

use crate::crd::{API_GROUP, API_VERSION};
use crate::runtime::{
    BackendError, ComponentManifest, ComponentRole, ComponentState, RuntimeBackend,
};
use crate::throttle::ApiThrottle;

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "cachepilot-runtime-controller";

/// Label naming the owning runtime.
pub const LABEL_RUNTIME: &str = "data.cachepilot.io/runtime";

/// Label naming the component role.
pub const LABEL_ROLE: &str = "data.cachepilot.io/role";

/// Label naming the engine.
pub const LABEL_ENGINE: &str = "data.cachepilot.io/engine";

/// Annotation carrying the fingerprint of the applied manifest.
pub const ANNOTATION_FINGERPRINT: &str = "data.cachepilot.io/manifest-fingerprint";

/// Label selector matching every object this controller manages.
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=cachepilot";

/// Runtime backend on top of the Kubernetes API.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    throttle: Arc<ApiThrottle>,
}

impl KubeBackend {
    pub fn new(client: Client, throttle: Arc<ApiThrottle>) -> Self {
        Self { client, throttle }
    }

    fn api(&self, key: &ResourceKey) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), key.namespace())
    }
}

fn component_name(key: &ResourceKey, role: ComponentRole) -> String {
    format!("{}-{}", key.name(), role)
}

fn classify(error: kube::Error) -> BackendError {
    match error {
        kube::Error::Api(e) if e.code == 400 || e.code == 403 || e.code == 422 => {
            BackendError::Rejected(e.message)
        }
        other => BackendError::Unavailable(other.to_string()),
    }
}

/// Option keys are turned into environment variables: `alluxio.master.port`
/// becomes `ALLUXIO_MASTER_PORT`.
fn option_env(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Render a component as a StatefulSet.
pub fn render_statefulset(key: &ResourceKey, manifest: &ComponentManifest) -> StatefulSet {
    let name = component_name(key, manifest.role);

    let selector = BTreeMap::from([
        (LABEL_RUNTIME.to_string(), key.name().to_string()),
        (LABEL_ROLE.to_string(), manifest.role.as_str().to_string()),
    ]);

    let mut labels = selector.clone();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "cachepilot".to_string(),
    );
    labels.insert(LABEL_ENGINE.to_string(), manifest.engine.to_string());

    let owner_references = manifest.owner_uid.as_ref().map(|uid| {
        vec![OwnerReference {
            api_version: format!("{}/{}", API_GROUP, API_VERSION),
            kind: "CacheRuntime".to_string(),
            name: key.name().to_string(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });

    let ports: Vec<ContainerPort> = manifest
        .ports
        .iter()
        .map(|(name, port)| ContainerPort {
            name: Some(name.clone()),
            container_port: i32::from(*port),
            host_port: Some(i32::from(*port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let env: Vec<EnvVar> = manifest
        .options
        .iter()
        .map(|(key, value)| EnvVar {
            name: option_env(key),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(key.namespace().to_string()),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_FINGERPRINT.to_string(),
                manifest.fingerprint(),
            )])),
            owner_references,
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(manifest.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: manifest.role.as_str().to_string(),
                        image: Some(manifest.image.clone()),
                        ports: (!ports.is_empty()).then_some(ports),
                        env: (!env.is_empty()).then_some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl RuntimeBackend for KubeBackend {
    async fn apply_component(
        &self,
        key: &ResourceKey,
        manifest: &ComponentManifest,
    ) -> Result<(), BackendError> {
        let name = component_name(key, manifest.role);
        let set = render_statefulset(key, manifest);

        self.throttle.acquire().await;
        self.api(key)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&set),
            )
            .await
            .map_err(classify)?;

        info!(key = %key, statefulset = %name, replicas = manifest.replicas, "Applied component");
        Ok(())
    }

    async fn component_status(
        &self,
        key: &ResourceKey,
        role: ComponentRole,
    ) -> Result<Option<ComponentState>, BackendError> {
        let name = component_name(key, role);
        self.throttle.acquire().await;
        let Some(set) = self.api(key).get_opt(&name).await.map_err(classify)? else {
            return Ok(None);
        };

        let spec = set.spec.as_ref();
        let image = spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
        let ready_replicas = set
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let fingerprint = set
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_FINGERPRINT))
            .cloned();

        debug!(key = %key, statefulset = %name, ready_replicas, replicas, "Read component status");
        Ok(Some(ComponentState {
            image,
            replicas,
            ready_replicas,
            fingerprint,
        }))
    }

    async fn delete_component(
        &self,
        key: &ResourceKey,
        role: ComponentRole,
    ) -> Result<bool, BackendError> {
        let name = component_name(key, role);
        self.throttle.acquire().await;
        match self.api(key).delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(key = %key, statefulset = %name, "Deleted component");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }
}
