//! Health and readiness predicates over a region's peer set. Pure functions;
//! schedulers use them to filter candidate regions.

use std::sync::Arc;

use keyplane_core::{RegionInfo, EMPTY_REGION_APPROXIMATE_SIZE};

use crate::cluster::ClusterInformer;

/// Allow balancing empty regions while the cluster has fewer regions than
/// this, so a young cluster can still spread out.
pub const BALANCE_EMPTY_REGION_THRESHOLD: usize = 50;

/// A region with no down peers and no pending peers.
pub fn is_region_healthy(region: &RegionInfo) -> bool {
    is_region_healthy_allow_pending(region) && region.pending_peers.is_empty()
}

/// Like `is_region_healthy`, but replicas still catching up are acceptable.
pub fn is_region_healthy_allow_pending(region: &RegionInfo) -> bool {
    region.down_peers.is_empty()
}

/// Whether the region is big enough to be worth balancing, or the cluster is
/// still small enough that even empty regions should move.
pub fn is_empty_region_allow_balance(cluster: &dyn ClusterInformer, region: &RegionInfo) -> bool {
    region.approximate_size > EMPTY_REGION_APPROXIMATE_SIZE
        || cluster.region_count() < BALANCE_EMPTY_REGION_THRESHOLD
}

/// Whether the region is fully replicated. With placement rules on, the rule
/// fitter decides; otherwise the region must have exactly the configured
/// replica count and no learners.
pub fn is_region_replicated(cluster: &dyn ClusterInformer, region: &RegionInfo) -> bool {
    if cluster.is_placement_rules_enabled() {
        return cluster.region_fit_satisfied(region);
    }
    region.learners().count() == 0 && region.peers.len() == cluster.max_replicas()
}

/// Closure form of `is_empty_region_allow_balance` for filter chains.
pub fn allow_balance_empty_region(
    cluster: Arc<dyn ClusterInformer>,
) -> impl Fn(&RegionInfo) -> bool {
    move |region| is_empty_region_allow_balance(cluster.as_ref(), region)
}

/// Closure form of `is_region_replicated` for filter chains.
pub fn replicated_region(cluster: Arc<dyn ClusterInformer>) -> impl Fn(&RegionInfo) -> bool {
    move |region| is_region_replicated(cluster.as_ref(), region)
}
