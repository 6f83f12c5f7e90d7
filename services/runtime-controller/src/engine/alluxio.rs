//! Alluxio: replicated master plus cache workers.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{EngineFactory, RuntimeProfile, StagedFactory};
use crate::crd::{CacheRuntime, CacheRuntimeSpec, EngineKind};

pub(crate) static PROFILE: RuntimeProfile = RuntimeProfile {
    kind: EngineKind::Alluxio,
    port_names: &["master-rpc", "worker-rpc"],
    default_master_image: "alluxio/alluxio:2.9.0",
    default_worker_image: "alluxio/alluxio:2.9.0",
    validate,
    reserved_ports,
};

pub(super) fn factory() -> Arc<dyn EngineFactory> {
    StagedFactory::shared(&PROFILE)
}

fn validate(spec: &CacheRuntimeSpec) -> Result<(), String> {
    // Journal quorum needs an odd member count.
    if spec.master.replicas % 2 == 0 {
        return Err(format!(
            "alluxio master replicas must be odd, got {}",
            spec.master.replicas
        ));
    }
    Ok(())
}

/// Ports pinned through `*.port` options on Alluxio runtimes.
fn reserved_ports(runtimes: &[CacheRuntime]) -> BTreeSet<u16> {
    runtimes
        .iter()
        .filter(|runtime| {
            let bound = runtime.status.as_ref().and_then(|s| s.engine);
            bound.or(runtime.spec.engine) == Some(EngineKind::Alluxio)
        })
        .flat_map(|runtime| runtime.spec.options.iter())
        .filter(|(key, _)| key.ends_with(".port"))
        .filter_map(|(_, value)| value.trim().parse::<u16>().ok())
        .collect()
}
