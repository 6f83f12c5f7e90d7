//! Kubernetes events about runtimes.
//!
//! Events are best effort: a failed publish is logged and dropped, it never
//! fails a reconciliation.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::crd::{CacheRuntime, API_GROUP, API_VERSION};
use crate::throttle::ApiThrottle;

/// Component name reported on events.
pub const REPORTING_COMPONENT: &str = "cachepilot-runtime-controller";

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for runtime events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        runtime: &CacheRuntime,
        type_: EventType,
        reason: &str,
        message: &str,
    );
}

/// Records events as `core/v1` Event objects.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    throttle: Arc<ApiThrottle>,
}

impl KubeEventRecorder {
    pub fn new(client: Client, throttle: Arc<ApiThrottle>) -> Self {
        Self { client, throttle }
    }
}

/// Build the Event object for a runtime.
pub fn render_event(
    runtime: &CacheRuntime,
    type_: EventType,
    reason: &str,
    message: &str,
) -> Event {
    let now = Time(chrono::Utc::now());
    let name = runtime.name_any();

    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", name)),
            namespace: runtime.namespace(),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(format!("{}/{}", API_GROUP, API_VERSION)),
            kind: Some("CacheRuntime".to_string()),
            name: Some(name),
            namespace: runtime.namespace(),
            uid: runtime.uid(),
            resource_version: runtime.resource_version(),
            ..Default::default()
        },
        type_: Some(type_.as_str().to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource {
            component: Some(REPORTING_COMPONENT.to_string()),
            ..Default::default()
        }),
        reporting_component: Some(REPORTING_COMPONENT.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        runtime: &CacheRuntime,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let namespace = runtime.namespace().unwrap_or_default();
        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        let event = render_event(runtime, type_, reason, message);

        self.throttle.acquire().await;
        match api.create(&PostParams::default(), &event).await {
            Ok(_) => debug!(runtime = %runtime.name_any(), reason, "Published event"),
            Err(e) => warn!(
                runtime = %runtime.name_any(),
                reason,
                error = %e,
                "Failed to publish event"
            ),
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub runtime: String,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons of every recorded event, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(
        &self,
        runtime: &CacheRuntime,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        debug!(runtime = %runtime.name_any(), reason, type_ = %type_, "[MOCK] Recording event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                runtime: runtime.name_any(),
                type_,
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CacheRuntimeSpec;

    fn runtime() -> CacheRuntime {
        let mut runtime = CacheRuntime::new("imagenet", CacheRuntimeSpec::default());
        runtime.metadata.namespace = Some("team-a".to_string());
        runtime.metadata.uid = Some("uid-7".to_string());
        runtime
    }

    #[test]
    fn test_render_event() {
        let event = render_event(&runtime(), EventType::Warning, "SetupFailed", "bad image");

        assert_eq!(event.metadata.generate_name.as_deref(), Some("imagenet."));
        assert_eq!(event.metadata.namespace.as_deref(), Some("team-a"));
        assert_eq!(event.involved_object.kind.as_deref(), Some("CacheRuntime"));
        assert_eq!(event.involved_object.uid.as_deref(), Some("uid-7"));
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.reason.as_deref(), Some("SetupFailed"));
    }

    #[tokio::test]
    async fn test_memory_recorder() {
        let recorder = MemoryRecorder::new();
        recorder
            .publish(&runtime(), EventType::Normal, "Ready", "all components ready")
            .await;
        recorder
            .publish(&runtime(), EventType::Warning, "Degraded", "worker 0/1 ready")
            .await;

        assert_eq!(recorder.reasons(), vec!["Ready", "Degraded"]);
        assert_eq!(recorder.events()[1].type_, EventType::Warning);
    }
}
