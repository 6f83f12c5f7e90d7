//! Port allocator recovery at startup.
//!
//! Ports recorded in runtime status are marked held before the allocator is
//! handed to any engine, so a restarted controller never hands out a port a
//! running runtime already listens on.

use std::sync::Arc;

use cachepilot_id::ResourceKey;
use cachepilot_networking::{AllocatePolicy, PortAllocator, PortRange};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::EngineCatalog;
use crate::store::{RuntimeStore, StoreError};

/// Port allocator setup errors.
#[derive(Debug, Error)]
pub enum PortSetupError {
    #[error("failed to list runtimes: {0}")]
    List(#[from] StoreError),
}

/// Build the shared allocator and restore recorded ports into it.
pub async fn setup_port_allocator(
    store: &dyn RuntimeStore,
    catalog: &EngineCatalog,
    range: PortRange,
    policy: AllocatePolicy,
) -> Result<Arc<PortAllocator<ResourceKey>>, PortSetupError> {
    let allocator = PortAllocator::with_policy(range, policy);
    let runtimes = store.list().await?;

    let mut restored = 0;
    for runtime in &runtimes {
        let Some(status) = runtime.status.as_ref() else {
            continue;
        };
        if status.ports.is_empty() {
            continue;
        }
        let key = match runtime.key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Skipping runtime with invalid key");
                continue;
            }
        };

        let ports: Vec<u16> = status.ports.values().copied().collect();
        let outside = ports.iter().filter(|port| !range.contains(**port)).count();
        if outside > 0 {
            warn!(
                key = %key,
                recorded = ?ports,
                range = %range,
                "Runtime records ports outside the configured range"
            );
        }

        // Ports the runtime still owns stay held even if some of its others
        // are taken; the engine moves it to a fresh layout on its next setup.
        let conflicts = allocator.restore_available(&key, &ports);
        if !conflicts.is_empty() {
            warn!(key = %key, conflicts = ?conflicts, "Recorded ports held by another runtime");
        }
        restored += ports.len() - outside - conflicts.len();
    }

    let reserved = allocator.reserve(catalog.reserved_ports(&runtimes));

    info!(
        range = %range,
        policy = allocator.policy(),
        runtimes = runtimes.len(),
        restored,
        reserved,
        available = allocator.available(),
        "Port allocator ready"
    );

    Ok(Arc::new(allocator))
}
