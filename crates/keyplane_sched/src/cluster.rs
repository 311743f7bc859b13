//! Capability surface the controller needs from the surrounding cluster.
//!
//! The real placement driver wires this to its live cluster state; tests wire
//! it to an in-memory `BasicCluster`. Keeping the surface narrow avoids a
//! reference cycle between the controller and the cluster that owns it.

use keyplane_core::{RegionInfo, StoreInfo, StoreLimitKind};

/// Read-mostly view of cluster state plus the store-limit reset path.
pub trait ClusterInformer: Send + Sync {
    fn get_region(&self, region_id: u64) -> Option<RegionInfo>;

    fn get_store(&self, store_id: u64) -> Option<StoreInfo>;

    fn region_count(&self) -> usize;

    fn is_placement_rules_enabled(&self) -> bool;

    fn max_replicas(&self) -> usize;

    /// Per-description cap on operators parked in the waiting bucket.
    fn scheduler_max_waiting_operator(&self) -> u64;

    /// Configured limit for `(store, kind)` in region units per balance
    /// window. Zero disables scheduling against the store.
    fn store_limit_rate(&self, store_id: u64, kind: StoreLimitKind) -> f64;

    /// Install a fresh token bucket on the store, dropping any balance.
    fn reset_store_limit(
        &self,
        store_id: u64,
        kind: StoreLimitKind,
        rate_per_sec: f64,
        capacity: f64,
    );

    /// Whether the placement-rule fitter considers the region satisfied.
    /// Only consulted when placement rules are enabled.
    fn region_fit_satisfied(&self, region: &RegionInfo) -> bool;
}
