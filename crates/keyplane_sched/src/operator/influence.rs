//! Projected cost of operators against the stores they touch.

use std::collections::HashMap;

use keyplane_core::StoreLimitKind;

/// Influence of a set of operators on one store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StoreInfluence {
    /// Net region size moved onto (positive) or off (negative) the store, MiB.
    pub region_size: i64,
    /// Net region count delta.
    pub region_count: i64,
    /// Net leader size delta, MiB.
    pub leader_size: i64,
    /// Net leader count delta.
    pub leader_count: i64,
    step_cost: HashMap<StoreLimitKind, i64>,
}

impl StoreInfluence {
    /// Token cost charged against the store's `kind` limit bucket.
    pub fn step_cost(&self, kind: StoreLimitKind) -> i64 {
        self.step_cost.get(&kind).copied().unwrap_or(0)
    }

    pub(crate) fn add_step_cost(&mut self, kind: StoreLimitKind, cost: i64) {
        *self.step_cost.entry(kind).or_insert(0) += cost;
    }
}

/// Influence of a set of operators, per affected store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OpInfluence {
    stores: HashMap<u64, StoreInfluence>,
}

impl OpInfluence {
    pub fn store_influence(&mut self, store_id: u64) -> &mut StoreInfluence {
        self.stores.entry(store_id).or_default()
    }

    pub fn get(&self, store_id: u64) -> Option<&StoreInfluence> {
        self.stores.get(&store_id)
    }

    pub fn store_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.stores.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
