//! File health evaluation against the backend liveness view.

use std::collections::HashMap;
use std::path::PathBuf;

use qsfs_zstor::{backend_key, BackendStatus, Metadata};

/// Counts fed into the `healthy_file_configs` / `unhealthy_file_configs`
/// gauges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthTally {
    pub healthy: u64,
    pub unhealthy: u64,
}

/// A file is healthy while at least `data_shards` of its shards sit on
/// backends currently reported alive. Shards live on data-type backends;
/// a backend missing from the scrape counts as dead.
pub fn file_is_healthy(metadata: &Metadata, backends: &HashMap<String, BackendStatus>) -> bool {
    let alive = metadata
        .shards
        .iter()
        .filter(|shard| {
            backends
                .get(&backend_key(
                    &shard.ci.address,
                    "data",
                    &shard.ci.namespace,
                ))
                .map_or(false, |backend| backend.is_alive)
        })
        .count();
    alive >= metadata.data_shards
}

pub fn tally(
    store: &HashMap<PathBuf, Metadata>,
    backends: &HashMap<String, BackendStatus>,
) -> HealthTally {
    let mut counts = HealthTally::default();
    for metadata in store.values() {
        if file_is_healthy(metadata, backends) {
            counts.healthy += 1;
        } else {
            counts.unhealthy += 1;
        }
    }
    counts
}
