//! The `CacheRuntime` custom resource.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cachepilot_id::{IdError, ResourceKey};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API group of the custom resource.
pub const API_GROUP: &str = "data.cachepilot.io";

/// API version of the custom resource.
pub const API_VERSION: &str = "v1alpha1";

/// Finalizer that holds deletion until teardown completes.
pub const FINALIZER: &str = "data.cachepilot.io/runtime-finalizer";

/// Condition type reporting whether the runtime is serving.
pub const CONDITION_READY: &str = "Ready";

/// Cache runtime technology driven by an engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Alluxio,
    Juicefs,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alluxio => "alluxio",
            Self::Juicefs => "juicefs",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine name that is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown engine '{0}' (expected alluxio or juicefs)")]
pub struct UnknownEngine(pub String);

impl FromStr for EngineKind {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alluxio" => Ok(Self::Alluxio),
            "juicefs" => Ok(Self::Juicefs),
            other => Err(UnknownEngine(other.to_string())),
        }
    }
}

/// Desired state of a cache runtime.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "data.cachepilot.io",
    version = "v1alpha1",
    kind = "CacheRuntime",
    plural = "cacheruntimes",
    shortname = "cachert",
    namespaced,
    status = "CacheRuntimeStatus",
    printcolumn = r#"{"name":"Engine", "type":"string", "jsonPath":".status.engine"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Workers Ready", "type":"integer", "jsonPath":".status.workerReadyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheRuntimeSpec {
    /// Engine implementation to use. Ignored once the status records a bound engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,

    /// Master (metadata) component.
    #[serde(default)]
    pub master: ComponentSpec,

    /// Worker (cache) component.
    #[serde(default)]
    pub worker: ComponentSpec,

    /// Engine-specific properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,

    /// Periodic re-sync interval; overrides the controller default. Zero disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period_seconds: Option<u64>,
}

/// Replica count and image for one component.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Image override; the engine default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl Default for ComponentSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            image: None,
        }
    }
}

/// Lifecycle phase recorded in status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RuntimePhase {
    #[default]
    Initializing,
    SettingUp,
    Ready,
    Degraded,
    Terminating,
    Failed,
}

impl RuntimePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::SettingUp => "SettingUp",
            Self::Ready => "Ready",
            Self::Degraded => "Degraded",
            Self::Terminating => "Terminating",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a cache runtime. Everything needed to resume after a
/// controller restart lives here.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheRuntimeStatus {
    #[serde(default)]
    pub phase: RuntimePhase,

    /// Engine bound on first setup. Authoritative once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,

    /// Named ports allocated to this runtime.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,

    #[serde(default)]
    pub master_ready_replicas: i32,

    #[serde(default)]
    pub worker_ready_replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False, or Unknown
    pub status: String,

    pub reason: String,

    pub message: String,

    /// RFC3339
    pub last_transition_time: String,
}

impl CacheRuntimeStatus {
    /// Find a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Set a condition. The transition time only moves when the status flips.
    pub fn set_condition(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        let status = if status { "True" } else { "False" };

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = chrono::Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            return;
        }

        self.conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
        });
    }
}

impl CacheRuntime {
    /// Identity of this object.
    pub fn key(&self) -> Result<ResourceKey, IdError> {
        ResourceKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Status, or the empty status if none was written yet.
    pub fn status_or_default(&self) -> CacheRuntimeStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Check if the teardown finalizer is present.
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Check if deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// `metadata.generation`, or 0 when the store does not track it.
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }
}
