//! Engine Registry: one engine instance per runtime.
//!
//! The map lock is held only long enough to find or insert a per-key slot.
//! Construction runs on the slot itself, so resolving one key never waits on
//! another key's construction, while concurrent resolves of the same key
//! share a single construction and never observe a half-built engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cachepilot_id::ResourceKey;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::crd::{CacheRuntimeStatus, EngineKind};
use crate::engine::{Engine, EngineCatalog, EngineError};

/// Shared handle to a live engine. Lock it only for one engine call.
pub type EngineHandle = Arc<tokio::sync::Mutex<Box<dyn Engine>>>;

type Slot = Arc<OnceCell<EngineHandle>>;

/// Live engines by runtime.
pub struct EngineRegistry {
    catalog: Arc<EngineCatalog>,
    slots: Mutex<HashMap<ResourceKey, Slot>>,
}

impl EngineRegistry {
    pub fn new(catalog: Arc<EngineCatalog>) -> Self {
        Self {
            catalog,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &EngineCatalog {
        &self.catalog
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine kind for a runtime. A kind recorded in status wins over `default`.
    pub fn infer_engine_kind(status: Option<&CacheRuntimeStatus>, default: EngineKind) -> EngineKind {
        status.and_then(|s| s.engine).unwrap_or(default)
    }

    /// Return the engine for `key`, building one of `kind` if there is none.
    ///
    /// An existing engine is returned as-is whatever `kind` says. A failed
    /// construction leaves nothing behind and is reported as permanent.
    pub async fn resolve(
        &self,
        key: &ResourceKey,
        kind: EngineKind,
    ) -> Result<EngineHandle, EngineError> {
        let slot = self.lock().entry(key.clone()).or_default().clone();

        let built = slot
            .get_or_try_init(|| async {
                let factory = self.catalog.get(kind).ok_or_else(|| {
                    EngineError::Permanent(format!("no engine registered for kind {}", kind))
                })?;
                let engine = factory.build(key).map_err(|e| match e {
                    EngineError::Permanent(msg) => EngineError::Permanent(msg),
                    other => EngineError::Permanent(other.to_string()),
                })?;
                info!(key = %key, engine = %kind, "Constructed engine");
                Ok::<EngineHandle, EngineError>(Arc::new(tokio::sync::Mutex::new(engine)))
            })
            .await;

        match built {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                warn!(key = %key, engine = %kind, error = %e, "Engine construction failed");
                let mut slots = self.lock();
                if slots
                    .get(key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    slots.remove(key);
                }
                Err(e)
            }
        }
    }

    /// Evict the engine for `key`. Evicting an absent key is a no-op.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            debug!(key = %key, "Evicted engine");
        }
        removed
    }

    /// Check if an engine exists for `key`.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of live engines.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("catalog", &self.catalog)
            .field("engines", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name).unwrap()
    }

    #[test]
    fn test_infer_engine_kind() {
        assert_eq!(
            EngineRegistry::infer_engine_kind(None, EngineKind::Alluxio),
            EngineKind::Alluxio
        );

        let unbound = CacheRuntimeStatus::default();
        assert_eq!(
            EngineRegistry::infer_engine_kind(Some(&unbound), EngineKind::Juicefs),
            EngineKind::Juicefs
        );

        let bound = CacheRuntimeStatus {
            engine: Some(EngineKind::Alluxio),
            ..Default::default()
        };
        assert_eq!(
            EngineRegistry::infer_engine_kind(Some(&bound), EngineKind::Juicefs),
            EngineKind::Alluxio
        );
    }

    #[tokio::test]
    async fn test_resolve_reuses_engine() {
        let registry = EngineRegistry::new(Arc::new(EngineCatalog::builtin()));
        let first = registry.resolve(&key("a"), EngineKind::Alluxio).await.unwrap();
        let second = registry.resolve(&key("a"), EngineKind::Juicefs).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.kind(), EngineKind::Alluxio);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_permanent() {
        let registry = EngineRegistry::new(Arc::new(EngineCatalog::new()));
        let Err(err) = registry.resolve(&key("a"), EngineKind::Juicefs).await else {
            panic!("resolve without a factory succeeded");
        };
        assert!(err.is_permanent());
        assert!(!registry.contains(&key("a")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_idempotent() {
        let registry = EngineRegistry::new(Arc::new(EngineCatalog::builtin()));
        registry.resolve(&key("a"), EngineKind::Alluxio).await.unwrap();

        assert!(registry.remove(&key("a")));
        assert!(!registry.remove(&key("a")));
        assert!(!registry.contains(&key("a")));
    }
}
