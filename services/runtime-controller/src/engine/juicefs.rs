//! JuiceFS: external metadata engine, optional single master.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{EngineFactory, RuntimeProfile, StagedFactory};
use crate::crd::{CacheRuntime, CacheRuntimeSpec, EngineKind};

/// Option naming the metadata engine URL.
pub const OPTION_METAURL: &str = "metaurl";

pub(crate) static PROFILE: RuntimeProfile = RuntimeProfile {
    kind: EngineKind::Juicefs,
    port_names: &["worker-metrics"],
    default_master_image: "juicedata/juicefs-fuse:ce-v1.1.0",
    default_worker_image: "juicedata/juicefs-fuse:ce-v1.1.0",
    validate,
    reserved_ports,
};

pub(super) fn factory() -> Arc<dyn EngineFactory> {
    StagedFactory::shared(&PROFILE)
}

fn validate(spec: &CacheRuntimeSpec) -> Result<(), String> {
    let metaurl = spec
        .options
        .get(OPTION_METAURL)
        .map(|v| v.trim())
        .unwrap_or_default();
    if metaurl.is_empty() {
        return Err(format!("juicefs requires option '{}'", OPTION_METAURL));
    }
    if spec.master.replicas > 1 {
        return Err(format!(
            "juicefs master replicas must be 0 or 1, got {}",
            spec.master.replicas
        ));
    }
    Ok(())
}

fn reserved_ports(_runtimes: &[CacheRuntime]) -> BTreeSet<u16> {
    BTreeSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ComponentSpec;
    use rstest::rstest;
    use std::collections::BTreeMap;

    #[rstest]
    #[case(Some("redis://meta:6379/1"), 0, true)]
    #[case(Some("redis://meta:6379/1"), 1, true)]
    #[case(Some("redis://meta:6379/1"), 2, false)]
    #[case(Some("  "), 1, false)]
    #[case(None, 1, false)]
    fn test_validate(#[case] metaurl: Option<&str>, #[case] master: i32, #[case] valid: bool) {
        let spec = CacheRuntimeSpec {
            master: ComponentSpec {
                replicas: master,
                image: None,
            },
            options: metaurl
                .map(|url| BTreeMap::from([(OPTION_METAURL.to_string(), url.to_string())]))
                .unwrap_or_default(),
            ..Default::default()
        };
        assert_eq!(validate(&spec).is_ok(), valid);
    }

    #[test]
    fn test_single_metrics_port() {
        assert_eq!(PROFILE.port_names, &["worker-metrics"]);
        assert!(factory().reserved_ports(&[]).is_empty());
    }
}
