//! Command line and environment configuration.

use std::time::Duration;

use cachepilot_networking::{AllocatePolicy, PortRange};
use cachepilot_reconcile::{QueueError, DEFAULT_BURST, DEFAULT_QPS};
use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::crd::EngineKind;
use crate::dispatcher::DispatcherConfig;
use crate::throttle::{DEFAULT_KUBE_API_BURST, DEFAULT_KUBE_API_QPS};

/// cachepilot runtime controller - reconciles CacheRuntime resources.
#[derive(Debug, Parser)]
#[command(name = "runtime-controller")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the controller against the current cluster.
    Start(StartArgs),

    /// Print the CacheRuntime CustomResourceDefinition as JSON.
    Crd,

    /// Show version.
    Version,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Port range handed out to runtimes, as "min-max" (inclusive).
    #[arg(long, env = "CACHEPILOT_RUNTIME_NODE_PORT_RANGE", default_value = "20000-25000")]
    pub runtime_node_port_range: PortRange,

    /// Port allocation policy (random or bitmap).
    #[arg(long, env = "CACHEPILOT_PORT_ALLOCATE_POLICY", default_value = "random")]
    pub port_allocate_policy: AllocatePolicy,

    /// Number of concurrent reconciliations.
    #[arg(long, env = "CACHEPILOT_RUNTIME_WORKERS", default_value_t = 3)]
    pub runtime_workers: usize,

    /// Backoff after the first failure.
    #[arg(
        long,
        env = "CACHEPILOT_WORKQUEUE_DEFAULT_SYNC_BACKOFF",
        default_value = "5ms",
        value_parser = humantime::parse_duration
    )]
    pub workqueue_default_sync_backoff: Duration,

    /// Backoff ceiling.
    #[arg(
        long,
        env = "CACHEPILOT_WORKQUEUE_MAX_SYNC_BACKOFF",
        default_value = "1000s",
        value_parser = humantime::parse_duration
    )]
    pub workqueue_max_sync_backoff: Duration,

    /// Steady requeue rate shared by all keys.
    #[arg(long, env = "CACHEPILOT_WORKQUEUE_QPS", default_value_t = DEFAULT_QPS)]
    pub workqueue_qps: f64,

    /// Requeue burst shared by all keys.
    #[arg(long, env = "CACHEPILOT_WORKQUEUE_BURST", default_value_t = DEFAULT_BURST)]
    pub workqueue_burst: u32,

    /// Default periodic re-sync of ready runtimes; "0s" disables it.
    #[arg(
        long,
        env = "CACHEPILOT_RESYNC_PERIOD",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub resync_period: Duration,

    /// Deadline for one reconciliation.
    #[arg(
        long,
        env = "CACHEPILOT_RECONCILE_TIMEOUT",
        default_value = "120s",
        value_parser = humantime::parse_duration
    )]
    pub reconcile_timeout: Duration,

    /// Sustained request rate to the API server.
    #[arg(long, env = "CACHEPILOT_KUBE_API_QPS", default_value_t = DEFAULT_KUBE_API_QPS)]
    pub kube_api_qps: f64,

    /// Request burst to the API server.
    #[arg(long, env = "CACHEPILOT_KUBE_API_BURST", default_value_t = DEFAULT_KUBE_API_BURST)]
    pub kube_api_burst: u32,

    /// Engine for runtimes that do not name one.
    #[arg(long, env = "CACHEPILOT_DEFAULT_ENGINE", default_value = "alluxio")]
    pub default_engine: EngineKind,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "CACHEPILOT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "CACHEPILOT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid work queue settings: {0}")]
    Queue(#[from] QueueError),

    #[error("runtime workers must be at least 1")]
    NoWorkers,

    #[error("reconcile timeout must be greater than zero")]
    ZeroTimeout,

    #[error("invalid API client rate limit: {0}")]
    KubeApi(QueueError),
}

/// Validated controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub port_range: PortRange,
    pub port_policy: AllocatePolicy,
    pub workers: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub qps: f64,
    pub burst: u32,
    pub reconcile_timeout: Duration,
    pub kube_api_qps: f64,
    pub kube_api_burst: u32,
    pub dispatcher: DispatcherConfig,
}

impl TryFrom<&StartArgs> for ControllerConfig {
    type Error = ConfigError;

    fn try_from(args: &StartArgs) -> Result<Self, Self::Error> {
        if args.runtime_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if args.reconcile_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if args.workqueue_default_sync_backoff.is_zero() {
            return Err(QueueError::ZeroBackoff.into());
        }
        if args.workqueue_default_sync_backoff > args.workqueue_max_sync_backoff {
            return Err(QueueError::BackoffOrder {
                base: args.workqueue_default_sync_backoff,
                max: args.workqueue_max_sync_backoff,
            }
            .into());
        }
        if !(args.workqueue_qps.is_finite() && args.workqueue_qps > 0.0) {
            return Err(QueueError::InvalidQps(args.workqueue_qps).into());
        }
        if args.workqueue_burst == 0 {
            return Err(QueueError::ZeroBurst.into());
        }
        if !(args.kube_api_qps.is_finite() && args.kube_api_qps > 0.0) {
            return Err(ConfigError::KubeApi(QueueError::InvalidQps(args.kube_api_qps)));
        }
        if args.kube_api_burst == 0 {
            return Err(ConfigError::KubeApi(QueueError::ZeroBurst));
        }

        Ok(Self {
            port_range: args.runtime_node_port_range,
            port_policy: args.port_allocate_policy,
            workers: args.runtime_workers,
            base_backoff: args.workqueue_default_sync_backoff,
            max_backoff: args.workqueue_max_sync_backoff,
            qps: args.workqueue_qps,
            burst: args.workqueue_burst,
            reconcile_timeout: args.reconcile_timeout,
            kube_api_qps: args.kube_api_qps,
            kube_api_burst: args.kube_api_burst,
            dispatcher: DispatcherConfig {
                default_engine: args.default_engine,
                resync_period: args.resync_period,
            },
        })
    }
}
