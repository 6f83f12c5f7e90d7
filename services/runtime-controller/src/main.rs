//! cachepilot Runtime Controller
//!
//! Watches `CacheRuntime` resources and converges each one onto its engine:
//! allocating ports, bringing up master and worker components, tracking
//! health and tearing everything down on deletion.
//!
//! ## Architecture
//!
//! - **Port Allocator**: restored from runtime status before anything runs
//! - **Controller**: work queue plus a pool of reconciliation workers
//! - **Dispatcher**: per-runtime state machine delegating to engines
//! - **Backend**: StatefulSets on the same cluster

use std::sync::Arc;

use anyhow::{Context, Result};
use cachepilot_id::ResourceKey;
use cachepilot_reconcile::{ControllerRateLimiter, WorkQueue};
use cachepilot_runtime_controller::config::{Cli, Command, ControllerConfig, LogFormat, StartArgs};
use cachepilot_runtime_controller::events::KubeEventRecorder;
use cachepilot_runtime_controller::kube_backend::KubeBackend;
use cachepilot_runtime_controller::ports::setup_port_allocator;
use cachepilot_runtime_controller::throttle::ApiThrottle;
use cachepilot_runtime_controller::{
    CacheRuntime, Controller, Dispatcher, EngineCatalog, EngineRegistry, KubeStore, RuntimeStore,
};
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => start(args).await,
        Command::Crd => {
            let crd = serde_json::to_string_pretty(&CacheRuntime::crd())?;
            println!("{}", crd);
            Ok(())
        }
        Command::Version => {
            println!("runtime-controller {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> Result<()> {
    init_tracing(&args.log_level, args.log_format);
    info!("Starting cachepilot runtime controller");

    let config = ControllerConfig::try_from(&args).context("invalid configuration")?;
    info!(
        port_range = %config.port_range,
        port_policy = %config.port_policy,
        workers = config.workers,
        default_engine = %config.dispatcher.default_engine,
        resync_period = ?config.dispatcher.resync_period,
        kube_api_qps = config.kube_api_qps,
        kube_api_burst = config.kube_api_burst,
        "Configuration loaded"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let throttle = Arc::new(ApiThrottle::new(config.kube_api_qps, config.kube_api_burst)?);
    let store: Arc<dyn RuntimeStore> =
        Arc::new(KubeStore::new(client.clone(), Arc::clone(&throttle)));
    let catalog = Arc::new(EngineCatalog::builtin());
    info!(engines = ?catalog.kinds(), "Engine catalog ready");

    // Ports recorded by existing runtimes must be held before any engine runs.
    let ports = setup_port_allocator(
        store.as_ref(),
        &catalog,
        config.port_range,
        config.port_policy,
    )
    .await
    .context("failed to restore port allocations")?;

    let registry = Arc::new(EngineRegistry::new(catalog));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        registry,
        ports,
        Arc::new(KubeBackend::new(client.clone(), Arc::clone(&throttle))),
        Arc::new(KubeEventRecorder::new(client, throttle)),
        config.dispatcher.clone(),
    ));

    let limiter = ControllerRateLimiter::<ResourceKey>::new(
        config.base_backoff,
        config.max_backoff,
        config.qps,
        config.burst,
    )?;
    let queue = Arc::new(WorkQueue::with_rate_limiter(limiter));

    let controller = Arc::new(Controller::new(
        dispatcher,
        store,
        queue,
        config.workers,
        config.reconcile_timeout,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
            return Ok(());
        }
    }

    // Signal shutdown and wait for in-flight reconciliations to stop
    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task panicked");
    }

    info!("Runtime controller shutdown complete");
    Ok(())
}
