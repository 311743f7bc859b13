//! In-memory cluster metadata: regions indexed by id and by key range,
//! plus the store set. This is the data structure behind a cluster snapshot;
//! transports and persistence live elsewhere.

use std::collections::HashMap;

use crate::region::{KeyRange, RegionInfo};
use crate::region_tree::RegionTree;
use crate::store::StoreInfo;
use crate::store_limit::StoreLimitKind;

/// Regions and stores of one cluster. Not internally synchronized; wrap it
/// in a lock when shared.
#[derive(Debug, Default)]
pub struct BasicCluster {
    regions_by_id: HashMap<u64, RegionInfo>,
    tree: RegionTree,
    stores: HashMap<u64, StoreInfo>,
}

impl BasicCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_region(&self, region_id: u64) -> Option<&RegionInfo> {
        self.regions_by_id.get(&region_id)
    }

    pub fn region_count(&self) -> usize {
        self.regions_by_id.len()
    }

    /// Install a heartbeat snapshot of a region. Overlapped entries are
    /// evicted from both indexes; the evicted regions are returned.
    pub fn put_region(&mut self, region: RegionInfo) -> Vec<RegionInfo> {
        let displaced = self.tree.update(region.clone());
        for old in &displaced {
            // The displaced set may include this region's own previous
            // snapshot; only drop ids the new entry does not claim.
            if old.id != region.id {
                self.regions_by_id.remove(&old.id);
            }
        }
        self.regions_by_id.insert(region.id, region);
        displaced
    }

    pub fn remove_region(&mut self, region_id: u64) -> Option<RegionInfo> {
        let region = self.regions_by_id.remove(&region_id)?;
        self.tree.remove(&region);
        Some(region)
    }

    /// The region containing `key`.
    pub fn search_region(&self, key: &[u8]) -> Option<&RegionInfo> {
        self.tree.search(key)
    }

    /// The region adjacent before the one containing `key`.
    pub fn search_prev_region(&self, key: &[u8]) -> Option<&RegionInfo> {
        self.tree.search_prev(key)
    }

    pub fn scan_regions(&self, start_key: &[u8], visitor: impl FnMut(&RegionInfo) -> bool) {
        self.tree.scan_range(start_key, visitor)
    }

    pub fn random_region(&self, ranges: &[KeyRange]) -> Option<&RegionInfo> {
        self.tree.random_region(ranges)
    }

    pub fn random_regions(&self, n: usize, ranges: &[KeyRange]) -> Vec<RegionInfo> {
        self.tree.random_regions(n, ranges)
    }

    pub fn total_region_size(&self) -> u64 {
        self.tree.total_size()
    }

    pub fn total_write_rate(&self) -> (f64, f64) {
        self.tree.total_write_rate()
    }

    pub fn put_store(&mut self, store: StoreInfo) {
        self.stores.insert(store.id, store);
    }

    pub fn get_store(&self, store_id: u64) -> Option<&StoreInfo> {
        self.stores.get(&store_id)
    }

    pub fn stores(&self) -> impl Iterator<Item = &StoreInfo> {
        self.stores.values()
    }

    /// Replace a store's limit bucket for `kind` with a fresh one.
    pub fn reset_store_limit(
        &self,
        store_id: u64,
        kind: StoreLimitKind,
        rate_per_sec: f64,
        capacity: f64,
    ) {
        if let Some(store) = self.stores.get(&store_id) {
            store.reset_store_limit(kind, rate_per_sec, capacity);
        } else {
            tracing::error!(store_id, "reset limit for unknown store");
        }
    }
}
