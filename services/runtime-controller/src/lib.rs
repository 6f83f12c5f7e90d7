//! cachepilot Runtime Controller Library
//!
//! The runtime controller reconciles `CacheRuntime` resources onto pluggable
//! cache engines. Each runtime is driven through setup, steady-state health
//! sync and teardown by an engine of the kind recorded in its status.
//!
//! ## Architecture
//!
//! ```text
//! Controller (worker pool)
//! ├── WorkQueue<ResourceKey>     (dedup, backoff, rate limit)
//! └── Dispatcher                 (per-runtime state machine)
//!     ├── EngineRegistry         (one engine per runtime)
//!     │   └── EngineCatalog      (kind -> factory, fixed at startup)
//!     ├── PortAllocator          (shared, restored from status)
//!     ├── RuntimeStore           (CacheRuntime objects)
//!     └── RuntimeBackend         (master/worker components)
//! ```
//!
//! ## Modules
//!
//! - `crd`: the `CacheRuntime` custom resource
//! - `store`: object store seam (API server or in-memory)
//! - `engine`: engine contract, catalog and the built-in engines
//! - `registry`: construct-once engine instances
//! - `dispatcher`: one reconciliation pass
//! - `controller`: worker pool, watch pump, outcome handling
//! - `ports`: allocator recovery at startup
//! - `runtime`, `kube_backend`: component control plane
//! - `throttle`: client-side API server rate limit
//! - `events`, `status`, `config`

pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod kube_backend;
pub mod ports;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod store;
pub mod throttle;

// Re-export commonly used types
pub use controller::Controller;
pub use crd::{CacheRuntime, CacheRuntimeSpec, CacheRuntimeStatus, EngineKind, RuntimePhase};
pub use dispatcher::{Dispatcher, DispatcherConfig, Outcome};
pub use engine::{Engine, EngineCatalog, EngineContext, EngineError, EngineFactory};
pub use registry::{EngineHandle, EngineRegistry};
pub use runtime::MockBackend;
pub use store::{InMemoryStore, KubeStore, RuntimeStore, StoreError};
