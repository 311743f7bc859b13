//! Shared fixtures for unit tests: an in-memory cluster view over
//! `BasicCluster` and a heartbeat sink that records what it was given.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use keyplane_core::{BasicCluster, RegionInfo, StoreInfo, StoreLimitKind};

use crate::cluster::ClusterInformer;
use crate::heartbeat::{HeartbeatSink, SchedulePayload};

pub(crate) struct MockCluster {
    basic: Mutex<BasicCluster>,
    placement_rules: AtomicBool,
    fit_satisfied: AtomicBool,
    max_replicas: AtomicUsize,
    max_waiting: AtomicU64,
    limit_rates: Mutex<HashMap<(u64, StoreLimitKind), f64>>,
}

impl MockCluster {
    pub(crate) fn new() -> Self {
        Self {
            basic: Mutex::new(BasicCluster::new()),
            placement_rules: AtomicBool::new(false),
            fit_satisfied: AtomicBool::new(true),
            max_replicas: AtomicUsize::new(3),
            max_waiting: AtomicU64::new(5),
            limit_rates: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn put_region(&self, region: RegionInfo) {
        self.basic.lock().unwrap().put_region(region);
    }

    pub(crate) fn remove_region(&self, region_id: u64) {
        self.basic.lock().unwrap().remove_region(region_id);
    }

    pub(crate) fn put_store(&self, store_id: u64) {
        self.basic.lock().unwrap().put_store(StoreInfo::new(store_id));
    }

    /// Configure the `(store, kind)` limit in region units per window.
    pub(crate) fn set_limit_rate(&self, store_id: u64, kind: StoreLimitKind, rate: f64) {
        self.limit_rates
            .lock()
            .unwrap()
            .insert((store_id, kind), rate);
    }

    pub(crate) fn set_placement_rules(&self, enabled: bool) {
        self.placement_rules.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_fit_satisfied(&self, satisfied: bool) {
        self.fit_satisfied.store(satisfied, Ordering::SeqCst);
    }

    pub(crate) fn set_max_replicas(&self, n: usize) {
        self.max_replicas.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_max_waiting(&self, n: u64) {
        self.max_waiting.store(n, Ordering::SeqCst);
    }
}

impl ClusterInformer for MockCluster {
    fn get_region(&self, region_id: u64) -> Option<RegionInfo> {
        self.basic.lock().unwrap().get_region(region_id).cloned()
    }

    fn get_store(&self, store_id: u64) -> Option<StoreInfo> {
        self.basic.lock().unwrap().get_store(store_id).cloned()
    }

    fn region_count(&self) -> usize {
        self.basic.lock().unwrap().region_count()
    }

    fn is_placement_rules_enabled(&self) -> bool {
        self.placement_rules.load(Ordering::SeqCst)
    }

    fn max_replicas(&self) -> usize {
        self.max_replicas.load(Ordering::SeqCst)
    }

    fn scheduler_max_waiting_operator(&self) -> u64 {
        self.max_waiting.load(Ordering::SeqCst)
    }

    fn store_limit_rate(&self, store_id: u64, kind: StoreLimitKind) -> f64 {
        self.limit_rates
            .lock()
            .unwrap()
            .get(&(store_id, kind))
            .copied()
            .unwrap_or(60.0)
    }

    fn reset_store_limit(
        &self,
        store_id: u64,
        kind: StoreLimitKind,
        rate_per_sec: f64,
        capacity: f64,
    ) {
        self.basic
            .lock()
            .unwrap()
            .reset_store_limit(store_id, kind, rate_per_sec, capacity);
    }

    fn region_fit_satisfied(&self, _region: &RegionInfo) -> bool {
        self.fit_satisfied.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    msgs: Mutex<Vec<(u64, SchedulePayload)>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take(&self) -> Vec<(u64, SchedulePayload)> {
        std::mem::take(&mut self.msgs.lock().unwrap())
    }

    pub(crate) fn len(&self) -> usize {
        self.msgs.lock().unwrap().len()
    }
}

impl HeartbeatSink for RecordingSink {
    fn send_msg(&self, region: &RegionInfo, payload: SchedulePayload) {
        self.msgs.lock().unwrap().push((region.id, payload));
    }
}
