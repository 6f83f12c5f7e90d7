//! Worker pool draining the reconcile queue.
//!
//! The controller:
//! - Seeds the queue with every existing runtime
//! - Pumps store change notifications into the queue
//! - Runs a fixed number of workers, each taking one key at a time
//! - Maps each dispatcher outcome onto the queue (forget, resync, backoff)

use std::sync::Arc;
use std::time::Duration;

use cachepilot_id::ResourceKey;
use cachepilot_reconcile::WorkQueue;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, Outcome};
use crate::store::RuntimeStore;

/// Runs reconciliation workers until shutdown.
pub struct Controller {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn RuntimeStore>,
    queue: Arc<WorkQueue<ResourceKey>>,
    workers: usize,
    reconcile_timeout: Duration,
}

impl Controller {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn RuntimeStore>,
        queue: Arc<WorkQueue<ResourceKey>>,
        workers: usize,
        reconcile_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            store,
            queue,
            workers: workers.max(1),
            reconcile_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ResourceKey>> {
        &self.queue
    }

    /// Run until `shutdown` flips to true, then drain workers and return.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.workers,
            reconcile_timeout_secs = self.reconcile_timeout.as_secs(),
            "Starting controller"
        );

        match self.store.list().await {
            Ok(runtimes) => {
                let mut seeded = 0;
                for runtime in &runtimes {
                    match runtime.key() {
                        Ok(key) => {
                            self.queue.add(key);
                            seeded += 1;
                        }
                        Err(e) => warn!(error = %e, "Skipping runtime with invalid key"),
                    }
                }
                info!(runtimes = seeded, "Seeded work queue");
            }
            // The watch delivers every object on its first sync anyway.
            Err(e) => warn!(error = %e, "Initial list failed, relying on watch"),
        }

        let pump = tokio::spawn(Arc::clone(&self).pump(shutdown.clone()));

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id, shutdown.clone())))
            .collect();

        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Controller shutting down");

        self.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        pump.abort();
        let _ = pump.await;

        info!("Controller stopped");
    }

    async fn pump(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.watch();
        loop {
            tokio::select! {
                change = changes.next() => match change {
                    Some(Ok(key)) => {
                        debug!(key = %key, "Observed change");
                        self.queue.add(key);
                    }
                    Some(Err(e)) => warn!(error = %e, "Watch error"),
                    None => {
                        warn!("Watch stream ended");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize, shutdown: watch::Receiver<bool>) {
        debug!(worker = id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key, shutdown.clone()).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "Worker stopped");
    }

    /// One reconciliation with its deadline, and the queue bookkeeping after it.
    pub async fn process(&self, key: &ResourceKey, shutdown: watch::Receiver<bool>) -> Option<Outcome> {
        let deadline = Instant::now() + self.reconcile_timeout;
        let result = tokio::time::timeout_at(
            deadline,
            self.dispatcher.reconcile(key, shutdown, Some(deadline)),
        )
        .await;

        match result {
            Ok(Outcome::Done | Outcome::Gone | Outcome::Halted) => {
                self.queue.forget(key);
            }
            Ok(Outcome::Resync(period)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), period);
            }
            Ok(Outcome::Backoff) => {
                self.queue.add_rate_limited(key.clone());
                debug!(key = %key, requeues = self.queue.num_requeues(key), "Requeued with backoff");
            }
            Err(_) => {
                warn!(key = %key, timeout_secs = self.reconcile_timeout.as_secs(), "Reconciliation timed out");
                self.queue.add_rate_limited(key.clone());
            }
        }

        result.ok()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.workers)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .field("queued", &self.queue.len())
            .finish()
    }
}
