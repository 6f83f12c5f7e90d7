//! Integration tests for the Engine Registry under concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cachepilot_id::ResourceKey;
use cachepilot_runtime_controller::engine::{Health, SetupOutcome};
use cachepilot_runtime_controller::{
    Engine, EngineCatalog, EngineContext, EngineError, EngineFactory, EngineKind, EngineRegistry,
};

struct NoopEngine;

#[async_trait]
impl Engine for NoopEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Alluxio
    }

    async fn setup(&mut self, _ctx: &EngineContext) -> Result<SetupOutcome, EngineError> {
        Ok(SetupOutcome::Ready)
    }

    async fn sync_status(&mut self, _ctx: &EngineContext) -> Result<Health, EngineError> {
        Ok(Health::Healthy)
    }

    async fn shutdown(&mut self, _ctx: &EngineContext) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Counts constructions. Building "slow" blocks until released; building
/// "broken" fails.
#[derive(Default)]
struct CountingFactory {
    built: AtomicUsize,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl EngineFactory for CountingFactory {
    fn kind(&self) -> EngineKind {
        EngineKind::Alluxio
    }

    fn build(&self, key: &ResourceKey) -> Result<Box<dyn Engine>, EngineError> {
        match key.name() {
            "broken" => return Err(EngineError::Transient("image registry down".to_string())),
            "slow" => {
                if let Some(gate) = self.gate.lock().unwrap().take() {
                    gate.recv().unwrap();
                }
            }
            _ => std::thread::sleep(Duration::from_millis(5)),
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NoopEngine))
    }
}

fn key(name: &str) -> ResourceKey {
    ResourceKey::new("default", name).unwrap()
}

fn registry(factory: Arc<CountingFactory>) -> Arc<EngineRegistry> {
    Arc::new(EngineRegistry::new(Arc::new(
        EngineCatalog::new().with(factory),
    )))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_construct_once_under_concurrency() {
    let factory = Arc::new(CountingFactory::default());
    let registry = registry(factory.clone());

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve(&key("shared"), EngineKind::Alluxio).await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_other_keys_do_not_wait() {
    let (release, gate) = mpsc::channel();
    let factory = Arc::new(CountingFactory {
        gate: Mutex::new(Some(gate)),
        ..Default::default()
    });
    let registry = registry(factory.clone());

    let slow = tokio::spawn({
        let registry = registry.clone();
        async move { registry.resolve(&key("slow"), EngineKind::Alluxio).await }
    });

    // Give the slow construction time to start and block.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!registry.contains(&key("slow")));

    let fast = tokio::time::timeout(
        Duration::from_secs(2),
        registry.resolve(&key("fast"), EngineKind::Alluxio),
    )
    .await
    .expect("resolve of an unrelated key blocked");
    assert!(fast.is_ok());
    assert!(registry.contains(&key("fast")));

    release.send(()).unwrap();
    slow.await.unwrap().unwrap();
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_construction_failure_is_permanent() {
    let factory = Arc::new(CountingFactory::default());
    let registry = registry(factory.clone());

    let Err(err) = registry.resolve(&key("broken"), EngineKind::Alluxio).await else {
        panic!("construction of a broken engine succeeded");
    };
    assert_eq!(err, EngineError::Permanent("transient: image registry down".to_string()));
    assert!(!registry.contains(&key("broken")));
    assert!(registry.is_empty());

    // A later resolve tries again instead of caching the failure.
    assert!(registry.resolve(&key("broken"), EngineKind::Alluxio).await.is_err());
    assert!(registry.resolve(&key("ok"), EngineKind::Alluxio).await.is_ok());
    assert_eq!(factory.built.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remove_then_resolve_builds_fresh() {
    let factory = Arc::new(CountingFactory::default());
    let registry = registry(factory.clone());

    let first = registry.resolve(&key("a"), EngineKind::Alluxio).await.unwrap();
    registry.remove(&key("a"));
    registry.remove(&key("a"));
    let second = registry.resolve(&key("a"), EngineKind::Alluxio).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(factory.built.load(Ordering::SeqCst), 2);
}
