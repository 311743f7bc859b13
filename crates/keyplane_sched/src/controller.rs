//! The operator controller: admits, sequences, dispatches, supervises, and
//! retires operators.
//!
//! One reader-writer lock guards the running set, the waiting bucket, the
//! notifier heap, and the step history. The TTL retention caches and the
//! metrics have their own interior locks so burial never nests the main
//! lock. `promote_waiting_operator` always acquires the lock itself; public
//! entry points release it before promoting to keep critical sections short.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use keyplane_core::{RegionInfo, StoreLimit, StoreLimitKind, REGION_INFLUENCE};

use crate::cache::TtlCache;
use crate::cluster::ClusterInformer;
use crate::heartbeat::HeartbeatSink;
use crate::metrics::ControllerMetrics;
use crate::operator::{
    OpHistory, OpInfluence, OpKind, OpStatus, OpStep, Operator, RandBuckets,
};

/// Dispatch originated from a store heartbeat.
pub const DISPATCH_FROM_HEARTBEAT: &str = "heartbeat";
/// Dispatch originated from the periodic push timer.
pub const DISPATCH_FROM_NOTIFIER_QUEUE: &str = "active push";
/// Dispatch originated from operator installation.
pub const DISPATCH_FROM_CREATE: &str = "create";

/// Tunables of the controller. The defaults match production behaviour;
/// tests shrink the windows.
#[derive(Clone, Copy, Debug)]
pub struct ControllerConfig {
    /// Keep finished step history entries this long.
    pub history_keep_time: Duration,
    /// Push cadence for steps that move data.
    pub slow_notify_interval: Duration,
    /// Push cadence for leadership and role changes.
    pub fast_notify_interval: Duration,
    /// How often the background loop polls the notifier heap.
    pub push_operator_tick_interval: Duration,
    /// Window over which a configured store limit is spread into a rate.
    pub store_balance_base_time: Duration,
    /// Operators finishing faster than this stay visible to influence
    /// queries for a while after burial.
    pub fast_operator_finish_time: Duration,
    /// How long a terminal status record stays queryable after burial.
    pub operator_status_remain_time: Duration,
    /// How often the background loop prunes history and sweeps TTL caches.
    pub retention_tick_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            history_keep_time: Duration::from_secs(5 * 60),
            slow_notify_interval: Duration::from_secs(5),
            fast_notify_interval: Duration::from_secs(2),
            push_operator_tick_interval: Duration::from_millis(500),
            store_balance_base_time: Duration::from_secs(60),
            fast_operator_finish_time: Duration::from_secs(10),
            operator_status_remain_time: Duration::from_secs(10 * 60),
            retention_tick_interval: Duration::from_secs(60),
        }
    }
}

/// A running operator and its terminal-or-live status at capture time.
#[derive(Clone)]
pub struct OperatorWithStatus {
    pub op: Arc<Operator>,
    pub status: OpStatus,
}

impl OperatorWithStatus {
    pub fn new(op: Arc<Operator>) -> Self {
        let status = op.status();
        Self { op, status }
    }

    /// JSON projection for the admin surface.
    pub fn to_json(&self) -> serde_json::Value {
        let steps: Vec<String> = (0..self.op.len())
            .filter_map(|i| self.op.step(i))
            .map(|step| step.to_string())
            .collect();
        serde_json::json!({
            "region_id": self.op.region_id(),
            "desc": self.op.desc(),
            "kind": format!("{:?}", self.op.kind()),
            "status": self.status.as_str(),
            "steps": steps,
            "cancel_reason": self.op.cancel_reason(),
            "additional_info": self.op.additional_info_json(),
        })
    }
}

/// Heap entry scheduling the next push for a running operator. Ordered so
/// the earliest deadline pops first.
struct NotifyItem {
    time: Instant,
    op: Arc<Operator>,
}

impl PartialEq for NotifyItem {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl Eq for NotifyItem {}

impl PartialOrd for NotifyItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for NotifyItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.time.cmp(&self.time)
    }
}

#[derive(Default)]
struct Inner {
    operators: HashMap<u64, Arc<Operator>>,
    counts: HashMap<OpKind, u64>,
    histories: VecDeque<OpHistory>,
    wop: RandBuckets,
    wop_status: HashMap<String, u64>,
    notifier: BinaryHeap<NotifyItem>,
}

/// Admits, promotes, dispatches, and retires operators for one cluster.
pub struct OperatorController {
    cluster: Arc<dyn ClusterInformer>,
    sink: Arc<dyn HeartbeatSink>,
    cfg: ControllerConfig,
    inner: RwLock<Inner>,
    fast_operators: TtlCache<u64, Arc<Operator>>,
    op_records: TtlCache<u64, OperatorWithStatus>,
    metrics: ControllerMetrics,
}

impl OperatorController {
    pub fn new(cluster: Arc<dyn ClusterInformer>, sink: Arc<dyn HeartbeatSink>) -> Self {
        Self::with_config(cluster, sink, ControllerConfig::default())
    }

    pub fn with_config(
        cluster: Arc<dyn ClusterInformer>,
        sink: Arc<dyn HeartbeatSink>,
        cfg: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            sink,
            cfg,
            inner: RwLock::new(Inner::default()),
            fast_operators: TtlCache::new(cfg.fast_operator_finish_time),
            op_records: TtlCache::new(cfg.operator_status_remain_time),
            metrics: ControllerMetrics::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterInformer> {
        &self.cluster
    }

    /// Drive the operator of `region` one step forward based on a fresh
    /// region snapshot.
    pub fn dispatch(&self, region: &RegionInfo, source: &str) {
        let Some(op) = self.get_operator(region.id) else {
            return;
        };
        let step = op.check(region);
        match op.status() {
            OpStatus::Started => {
                if source == DISPATCH_FROM_HEARTBEAT
                    && self.check_stale_operator(&op, step.as_ref(), region)
                {
                    return;
                }
                if let Some(step) = &step {
                    self.send_schedule_command(region, step, source);
                }
            }
            OpStatus::Success => {
                self.push_history(&op);
                if self.remove_operator(&op, None) {
                    self.promote_waiting_operator();
                }
                if op.running_time() < self.cfg.fast_operator_finish_time {
                    tracing::debug!(region_id = region.id, "operator finished fast");
                    self.fast_operators.put(region.id, op.clone());
                    self.metrics.fast_finished();
                }
            }
            OpStatus::Timeout => {
                if self.remove_operator(&op, None) {
                    self.promote_waiting_operator();
                }
            }
            status => {
                // Created and Expired never reach dispatch; Canceled and
                // Replaced are removed before their transition.
                if self.remove_operator_without_bury(&op) {
                    tracing::error!(
                        region_id = region.id,
                        status = status.as_str(),
                        operator = %op,
                        "dispatching operator with unexpected status"
                    );
                    debug_assert!(false, "dispatching operator with unexpected status: {op}");
                    self.metrics.unexpected_status();
                    let _ = op.cancel();
                    self.bury_operator(&op, None);
                    self.promote_waiting_operator();
                }
            }
        }
    }

    fn check_stale_operator(
        &self,
        op: &Arc<Operator>,
        step: Option<&OpStep>,
        region: &RegionInfo,
    ) -> bool {
        if let Some(step) = step {
            if let Err(err) = step.check_in_progress(self.cluster.as_ref(), region) {
                if self.remove_operator(op, Some(&err.to_string())) {
                    self.metrics.stale_operators();
                    self.promote_waiting_operator();
                    return true;
                }
            }
        }
        // The heartbeat may carry a newer conf-ver than the operator has
        // planned for; such an operator would fight the actual state.
        let origin = op.region_epoch();
        let changes = region.epoch.conf_ver.saturating_sub(origin.conf_ver);
        if changes > op.conf_ver_changed(region) {
            if self.remove_operator(
                op,
                Some("stale operator, confver does not meet expectations"),
            ) {
                tracing::debug!(
                    region_id = region.id,
                    latest_epoch = ?region.epoch,
                    diff = changes,
                    "operator confver fell behind the region"
                );
                self.metrics.stale_operators();
                self.promote_waiting_operator();
                return true;
            }
        }
        false
    }

    fn next_push_time(&self, step: Option<&OpStep>, now: Instant) -> Instant {
        let interval = match step {
            Some(step) if step.is_fast_step() => self.cfg.fast_notify_interval,
            _ => self.cfg.slow_notify_interval,
        };
        now + interval
    }

    /// Pop the next operator due for a push. Returns the region to dispatch
    /// and whether another attempt may find more work.
    fn poll_need_dispatch_region(&self) -> (Option<RegionInfo>, bool) {
        let mut inner = self.inner.write().unwrap();
        let Some(item) = inner.notifier.pop() else {
            return (None, false);
        };
        let region_id = item.op.region_id();
        // Stale heap entries are filtered here instead of being cancelled in
        // place when their operator goes away.
        let Some(op) = inner.operators.get(&region_id).cloned() else {
            return (None, true);
        };
        let Some(region) = self.cluster.get_region(region_id) else {
            let _ = self.remove_operator_inner(&mut inner, &op);
            op.set_cancel_reason("region disappeared");
            if op.cancel() {
                tracing::warn!(
                    region_id,
                    operator = %op,
                    "remove operator because region disappeared"
                );
                self.metrics.disappeared_regions();
            }
            self.bury_operator(&op, Some("region disappeared"));
            return (None, true);
        };
        let step = op.check(&region);
        let now = Instant::now();
        let Some(step) = step else {
            // No step left: hand the region over so the dispatcher can act
            // on the terminal status; the refreshed entry is filtered once
            // the operator leaves the map.
            inner.notifier.push(NotifyItem {
                time: self.next_push_time(None, now),
                op: item.op,
            });
            return (Some(region), true);
        };
        if now < item.time {
            inner.notifier.push(item);
            return (None, false);
        }
        inner.notifier.push(NotifyItem {
            time: self.next_push_time(Some(&step), now),
            op: item.op,
        });
        (Some(region), true)
    }

    /// Periodically re-push unfinished operators towards the stores.
    pub fn push_operators(&self) {
        loop {
            let (region, next) = self.poll_need_dispatch_region();
            if !next {
                break;
            }
            if let Some(region) = region {
                self.dispatch(&region, DISPATCH_FROM_NOTIFIER_QUEUE);
            }
        }
    }

    /// Admit operators into the waiting bucket. Merge operators must arrive
    /// as adjacent pairs; a broken pair cancels the whole unit. Returns how
    /// many operators were accepted.
    pub fn add_waiting_operator(&self, ops: Vec<Arc<Operator>>) -> usize {
        let mut added = 0;
        {
            let mut inner = self.inner.write().unwrap();
            let mut i = 0;
            while i < ops.len() {
                let op = &ops[i];
                let desc = op.desc().to_string();
                let mut unit = vec![op.clone()];
                if op.kind().contains(OpKind::MERGE) {
                    match ops.get(i + 1) {
                        Some(next) if next.kind().contains(OpKind::MERGE) => {
                            unit.push(next.clone());
                        }
                        Some(next) => {
                            tracing::error!(
                                desc = next.desc(),
                                "merge operator should be paired"
                            );
                            let _ = op.cancel();
                            self.bury_operator(op, Some("merge operator not paired"));
                            let _ = next.cancel();
                            self.bury_operator(next, Some("merge operator not paired"));
                            break;
                        }
                        None => {
                            tracing::error!(desc, "orphan merge operator found");
                            let _ = op.cancel();
                            self.bury_operator(op, Some("orphan merge operator"));
                            break;
                        }
                    }
                }
                if !self.check_add_operator(&inner, &unit) {
                    for op in &unit {
                        let _ = op.cancel();
                        self.bury_operator(op, None);
                    }
                    break;
                }
                let unit_len = unit.len();
                for op in unit {
                    self.metrics.waiting_added();
                    inner.wop.put_operator(op);
                }
                *inner.wop_status.entry(desc).or_insert(0) += 1;
                added += unit_len;
                i += unit_len;
            }
        }
        self.promote_waiting_operator();
        added
    }

    /// Admit operators straight into the running set, bypassing the waiting
    /// bucket. Store limits are enforced up front.
    pub fn add_operator(&self, ops: Vec<Arc<Operator>>) -> bool {
        let mut inner = self.inner.write().unwrap();
        if self.exceed_store_limit(&ops) || !self.check_add_operator(&inner, &ops) {
            for op in &ops {
                let _ = op.cancel();
                self.bury_operator(op, None);
            }
            return false;
        }
        for op in ops {
            if !self.add_operator_inner(&mut inner, op) {
                return false;
            }
        }
        true
    }

    /// Move waiting units into the running set while capacity allows. Units
    /// that no longer pass admission are cancelled on the spot.
    pub fn promote_waiting_operator(&self) {
        let mut inner = self.inner.write().unwrap();
        let unit = loop {
            let Some(unit) = inner.wop.get_operator() else {
                return;
            };
            let desc = unit[0].desc().to_string();
            if self.exceed_store_limit(&unit) || !self.check_add_operator(&inner, &unit) {
                for op in &unit {
                    self.metrics.waiting_rejected();
                    let _ = op.cancel();
                    self.bury_operator(op, None);
                }
                decrement_waiting(&mut inner.wop_status, &desc);
                continue;
            }
            decrement_waiting(&mut inner.wop_status, &desc);
            break unit;
        };
        for op in unit {
            self.metrics.waiting_promoted();
            if !self.add_operator_inner(&mut inner, op) {
                break;
            }
        }
    }

    /// Whether every operator in the unit may be admitted right now.
    fn check_add_operator(&self, inner: &Inner, ops: &[Arc<Operator>]) -> bool {
        for op in ops {
            let region_id = op.region_id();
            let Some(region) = self.cluster.get_region(region_id) else {
                tracing::debug!(region_id, "region not found, cancel add operator");
                self.metrics.admission_rejected();
                return false;
            };
            if region.epoch != op.region_epoch() {
                tracing::debug!(
                    region_id,
                    old = ?region.epoch,
                    new = ?op.region_epoch(),
                    "region epoch not match, cancel add operator"
                );
                self.metrics.admission_rejected();
                return false;
            }
            if let Some(old) = inner.operators.get(&region_id) {
                if op.priority() <= old.priority() {
                    tracing::debug!(region_id, old = %old, "already have operator, cancel add operator");
                    self.metrics.admission_rejected();
                    return false;
                }
            }
            if op.status() != OpStatus::Created {
                tracing::error!(
                    region_id,
                    status = op.status().as_str(),
                    operator = %op,
                    "trying to add operator with unexpected status"
                );
                debug_assert!(false, "adding operator with unexpected status: {op}");
                self.metrics.unexpected_status();
                return false;
            }
            let waiting = inner.wop_status.get(op.desc()).copied().unwrap_or(0);
            if waiting >= self.cluster.scheduler_max_waiting_operator() {
                tracing::debug!(
                    desc = op.desc(),
                    waiting,
                    "exceed max waiting operators, cancel add operator"
                );
                self.metrics.admission_rejected();
                return false;
            }
        }
        let mut expired = false;
        for op in ops {
            if op.check_expired() {
                expired = true;
            }
        }
        !expired
    }

    /// Install one operator as the running operator of its region. Any prior
    /// operator has lost the priority check already and is replaced.
    fn add_operator_inner(&self, inner: &mut Inner, op: Arc<Operator>) -> bool {
        let region_id = op.region_id();
        tracing::info!(
            region_id,
            operator = %op,
            additional_info = %op.additional_info_json(),
            "add operator"
        );

        if let Some(old) = inner.operators.get(&region_id).cloned() {
            let _ = self.remove_operator_inner(inner, &old);
            let _ = old.replace();
            self.bury_operator(&old, None);
        }

        if !op.start() {
            tracing::error!(
                region_id,
                status = op.status().as_str(),
                operator = %op,
                "adding operator with unexpected status"
            );
            debug_assert!(false, "starting operator with unexpected status: {op}");
            self.metrics.unexpected_status();
            return false;
        }
        inner.operators.insert(region_id, op.clone());
        self.metrics.operators_started();
        update_counts(inner);

        let influence = total_op_influence(std::slice::from_ref(&op), self.cluster.as_ref());
        for store_id in influence.store_ids() {
            let Some(store) = self.cluster.get_store(store_id) else {
                tracing::error!(store_id, "invalid store id");
                continue;
            };
            let store_influence = influence.get(store_id).expect("store id from influence");
            for kind in StoreLimitKind::ALL {
                let cost = store_influence.step_cost(kind);
                if cost == 0 {
                    continue;
                }
                if let Some(limit) = store.store_limit(kind) {
                    limit.take(cost);
                }
            }
        }

        let mut step = None;
        if let Some(region) = self.cluster.get_region(region_id) {
            step = op.check(&region);
            if let Some(step) = &step {
                self.send_schedule_command(&region, step, DISPATCH_FROM_CREATE);
            }
        }
        inner.notifier.push(NotifyItem {
            time: self.next_push_time(step.as_ref(), Instant::now()),
            op,
        });
        true
    }

    /// Remove a running operator, cancel it if still live, and bury it.
    /// False when the map no longer points at this exact operator.
    pub fn remove_operator(&self, op: &Arc<Operator>, reason: Option<&str>) -> bool {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            self.remove_operator_inner(&mut inner, op)
        };
        if removed {
            if let Some(reason) = reason {
                op.set_cancel_reason(reason);
            }
            if op.cancel() {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "operator removed"
                );
            }
            self.bury_operator(op, reason);
        }
        removed
    }

    fn remove_operator_without_bury(&self, op: &Arc<Operator>) -> bool {
        let mut inner = self.inner.write().unwrap();
        self.remove_operator_inner(&mut inner, op)
    }

    fn remove_operator_inner(&self, inner: &mut Inner, op: &Arc<Operator>) -> bool {
        match inner.operators.get(&op.region_id()) {
            Some(current) if Arc::ptr_eq(current, op) => {
                inner.operators.remove(&op.region_id());
                update_counts(inner);
                self.metrics.operators_removed();
                true
            }
            _ => false,
        }
    }

    /// Log the terminal outcome, bump counters, and park a status record in
    /// the TTL cache. The status must already be terminal; anything else is
    /// an internal error and gets force-cancelled.
    fn bury_operator(&self, op: &Arc<Operator>, reason: Option<&str>) {
        let status = op.status();
        if !status.is_end() {
            tracing::error!(
                region_id = op.region_id(),
                status = status.as_str(),
                operator = %op,
                "burying operator with non-end status"
            );
            debug_assert!(false, "burying operator with non-end status: {op}");
            self.metrics.unexpected_status();
            let _ = op.cancel();
        }
        match op.status() {
            OpStatus::Success => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    additional_info = %op.additional_info_json(),
                    "operator finish"
                );
                self.metrics.operators_finished();
            }
            OpStatus::Replaced => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "replace old operator"
                );
                self.metrics.operators_replaced();
            }
            OpStatus::Expired => {
                tracing::info!(
                    region_id = op.region_id(),
                    lives = ?op.elapsed(),
                    operator = %op,
                    "operator expired"
                );
                self.metrics.operators_expired();
            }
            OpStatus::Timeout => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "operator timeout"
                );
                self.metrics.operators_timed_out();
            }
            OpStatus::Canceled => {
                let reason = reason
                    .map(str::to_owned)
                    .or_else(|| op.cancel_reason())
                    .unwrap_or_default();
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    reason,
                    "operator canceled"
                );
                self.metrics.operators_canceled();
            }
            OpStatus::Created | OpStatus::Started => {}
        }
        self.op_records
            .put(op.region_id(), OperatorWithStatus::new(op.clone()));
    }

    /// The running operator of a region, or its terminal record while the
    /// retention window lasts.
    pub fn get_operator_status(&self, region_id: u64) -> Option<OperatorWithStatus> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(op) = inner.operators.get(&region_id) {
                return Some(OperatorWithStatus::new(op.clone()));
            }
        }
        self.op_records.get(&region_id)
    }

    pub fn get_operator(&self, region_id: u64) -> Option<Arc<Operator>> {
        self.inner.read().unwrap().operators.get(&region_id).cloned()
    }

    pub fn get_operators(&self) -> Vec<Arc<Operator>> {
        self.inner.read().unwrap().operators.values().cloned().collect()
    }

    pub fn get_waiting_operators(&self) -> Vec<Arc<Operator>> {
        self.inner.read().unwrap().wop.list_operators()
    }

    /// Project a step into an outbound command and hand it to the sink.
    pub fn send_schedule_command(&self, region: &RegionInfo, step: &OpStep, source: &str) {
        tracing::info!(region_id = region.id, step = %step, source, "send schedule command");
        let Some(payload) = step.command(region) else {
            return;
        };
        self.sink.send_msg(region, payload);
        self.metrics.commands_sent();
    }

    fn push_history(&self, op: &Arc<Operator>) {
        let mut inner = self.inner.write().unwrap();
        for history in op.history() {
            inner.histories.push_front(history);
        }
    }

    /// Drop history entries older than the retention window from the tail.
    pub fn prune_history(&self) {
        let mut inner = self.inner.write().unwrap();
        let keep = self.cfg.history_keep_time;
        while let Some(back) = inner.histories.back() {
            if back.finish_time.elapsed() > keep {
                inner.histories.pop_back();
            } else {
                break;
            }
        }
    }

    /// History entries finishing at or after `start`, newest first.
    pub fn get_history(&self, start: Instant) -> Vec<OpHistory> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for history in &inner.histories {
            if history.finish_time < start {
                break;
            }
            out.push(*history);
        }
        out
    }

    /// Number of running operators attributed to a scheduler kind.
    pub fn operator_count(&self, kind: OpKind) -> u64 {
        self.inner
            .read()
            .unwrap()
            .counts
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Unfinished influence of live operators that are neither timed out nor
    /// already complete.
    pub fn get_op_influence(&self, cluster: &dyn ClusterInformer) -> OpInfluence {
        let mut influence = OpInfluence::default();
        let inner = self.inner.read().unwrap();
        for op in inner.operators.values() {
            if !op.check_timeout() && !op.check_success() {
                if let Some(region) = cluster.get_region(op.region_id()) {
                    op.unfinished_influence(&mut influence, &region);
                }
            }
        }
        influence
    }

    /// Add the total influence of recently fast-finished operators, so a
    /// burst of quick moves still counts against balance decisions.
    pub fn get_fast_op_influence(&self, cluster: &dyn ClusterInformer, influence: &mut OpInfluence) {
        for region_id in self.fast_operators.keys() {
            let Some(op) = self.fast_operators.get(&region_id) else {
                continue;
            };
            if let Some(region) = cluster.get_region(op.region_id()) {
                op.total_influence(influence, &region);
            }
        }
    }

    /// Whether admitting `ops` would overdraw any store's limit bucket.
    pub fn exceed_store_limit(&self, ops: &[Arc<Operator>]) -> bool {
        let influence = total_op_influence(ops, self.cluster.as_ref());
        for store_id in influence.store_ids() {
            let store_influence = influence.get(store_id).expect("store id from influence");
            for kind in StoreLimitKind::ALL {
                let cost = store_influence.step_cost(kind);
                if cost == 0 {
                    continue;
                }
                let Some(limit) = self.store_limit_for(store_id, kind) else {
                    return false;
                };
                if limit.available() < cost {
                    return true;
                }
            }
        }
        false
    }

    /// The live bucket for `(store, kind)`, installing or refreshing it when
    /// the configured rate changed since the bucket was built.
    fn store_limit_for(&self, store_id: u64, kind: StoreLimitKind) -> Option<Arc<StoreLimit>> {
        let configured = self.cluster.store_limit_rate(store_id, kind);
        let window = self.cfg.store_balance_base_time.as_secs_f64().max(1.0);
        let rate_per_sec = configured * REGION_INFLUENCE as f64 / window;
        let capacity = configured * REGION_INFLUENCE as f64;
        let Some(store) = self.cluster.get_store(store_id) else {
            tracing::error!(store_id, "invalid store id");
            return None;
        };
        match store.store_limit(kind) {
            None => self
                .cluster
                .reset_store_limit(store_id, kind, rate_per_sec, capacity),
            Some(limit) if (limit.rate() - rate_per_sec).abs() > f64::EPSILON => self
                .cluster
                .reset_store_limit(store_id, kind, rate_per_sec, capacity),
            Some(_) => {}
        }
        self.cluster.get_store(store_id)?.store_limit(kind)
    }

    /// Install a running operator directly, skipping admission. Test
    /// support for schedulers and simulators.
    pub fn set_operator(&self, op: Arc<Operator>) {
        let mut inner = self.inner.write().unwrap();
        inner.operators.insert(op.region_id(), op);
        update_counts(&mut inner);
    }

    /// Sweep expired entries out of the retention caches.
    pub fn gc_retention(&self) {
        self.fast_operators.gc();
        self.op_records.gc();
    }
}

fn update_counts(inner: &mut Inner) {
    inner.counts.clear();
    for op in inner.operators.values() {
        *inner.counts.entry(op.scheduler_kind()).or_insert(0) += 1;
    }
}

fn decrement_waiting(wop_status: &mut HashMap<String, u64>, desc: &str) {
    if let Some(count) = wop_status.get_mut(desc) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            wop_status.remove(desc);
        }
    }
}

/// Total projected influence of `ops` against each affected store.
pub fn total_op_influence(ops: &[Arc<Operator>], cluster: &dyn ClusterInformer) -> OpInfluence {
    let mut influence = OpInfluence::default();
    for op in ops {
        if let Some(region) = cluster.get_region(op.region_id()) {
            op.total_influence(&mut influence, &region);
        }
    }
    influence
}

/// Handle over the controller's background loops. Shutting down (or
/// aborting) stops the push and retention tickers.
pub struct ControllerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start the periodic push loop and the retention sweeper for a controller.
pub fn spawn_background(controller: Arc<OperatorController>) -> ControllerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let cfg = *controller.config();
    let task = tokio::spawn(async move {
        let mut push = tokio::time::interval(cfg.push_operator_tick_interval);
        let mut retention = tokio::time::interval(cfg.retention_tick_interval);
        loop {
            tokio::select! {
                _ = push.tick() => controller.push_operators(),
                _ = retention.tick() => {
                    controller.prune_history();
                    controller.gc_retention();
                }
                _ = &mut shutdown_rx => break,
            }
        }
        controller.fast_operators.clear();
        controller.op_records.clear();
    });
    ControllerHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::SchedulePayload;
    use crate::operator::{OpHistoryKind, PriorityLevel};
    use crate::test_util::{MockCluster, RecordingSink};
    use keyplane_core::{Peer, RegionEpoch};

    fn setup() -> (Arc<MockCluster>, Arc<RecordingSink>, OperatorController) {
        setup_with_config(ControllerConfig::default())
    }

    fn setup_with_config(
        cfg: ControllerConfig,
    ) -> (Arc<MockCluster>, Arc<RecordingSink>, OperatorController) {
        let cluster = Arc::new(MockCluster::new());
        let sink = Arc::new(RecordingSink::new());
        for store_id in 1..=3 {
            cluster.put_store(store_id);
        }
        let controller = OperatorController::with_config(cluster.clone(), sink.clone(), cfg);
        (cluster, sink, controller)
    }

    /// Region `id` covers `[id, id+1)` with voters on stores 1 and 2, leader
    /// on store 1.
    fn seed_region(cluster: &MockCluster, id: u64) -> RegionInfo {
        let mut region = RegionInfo::new(id, vec![id as u8], vec![id as u8 + 1]);
        region.peers = vec![Peer::new(id * 10 + 1, 1), Peer::new(id * 10 + 2, 2)];
        region.leader = Some(region.peers[0]);
        region.approximate_size = 10;
        cluster.put_region(region.clone());
        region
    }

    fn transfer_op(region: &RegionInfo, to_store: u64) -> Arc<Operator> {
        Arc::new(Operator::new(
            "transfer-leader",
            region.id,
            region.epoch,
            OpKind::LEADER,
            vec![OpStep::TransferLeader { to_store }],
        ))
    }

    fn add_peer_op(region: &RegionInfo, peer_id: u64, to_store: u64) -> Arc<Operator> {
        Arc::new(Operator::new(
            "balance-region",
            region.id,
            region.epoch,
            OpKind::REGION,
            vec![OpStep::AddPeer { peer_id, to_store }],
        ))
    }

    fn merge_pair(
        source: &RegionInfo,
        target: &RegionInfo,
    ) -> (Arc<Operator>, Arc<Operator>) {
        let active = Arc::new(Operator::new(
            "merge-region",
            source.id,
            source.epoch,
            OpKind::MERGE,
            vec![OpStep::MergeRegion {
                from: Box::new(source.clone()),
                target: Box::new(target.clone()),
                is_passive: false,
            }],
        ));
        let passive = Arc::new(Operator::new(
            "merge-region",
            target.id,
            target.epoch,
            OpKind::MERGE,
            vec![OpStep::MergeRegion {
                from: Box::new(target.clone()),
                target: Box::new(target.clone()),
                is_passive: true,
            }],
        ));
        (active, passive)
    }

    #[test]
    fn add_operator_installs_and_sends_create_command() {
        let (cluster, sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);

        assert!(controller.add_operator(vec![op.clone()]));
        assert_eq!(op.status(), OpStatus::Started);
        assert!(Arc::ptr_eq(&controller.get_operator(1).unwrap(), &op));
        assert_eq!(controller.operator_count(OpKind::LEADER), 1);

        let msgs = sink.take();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, 1);
        match &msgs[0].1 {
            SchedulePayload::TransferLeader { peer } => assert_eq!(peer.store_id, 2),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn lower_priority_collision_is_rejected() {
        let (cluster, _sink, controller) = setup();
        let region = seed_region(&cluster, 1);

        let op1 = Arc::new(
            Operator::new(
                "transfer-leader",
                region.id,
                region.epoch,
                OpKind::LEADER,
                vec![OpStep::TransferLeader { to_store: 2 }],
            )
            .with_priority(PriorityLevel::High),
        );
        assert_eq!(controller.add_waiting_operator(vec![op1.clone()]), 1);
        assert_eq!(op1.status(), OpStatus::Started, "promoted straight away");

        let op2 = Arc::new(
            Operator::new(
                "transfer-leader",
                region.id,
                region.epoch,
                OpKind::LEADER,
                vec![OpStep::TransferLeader { to_store: 2 }],
            )
            .with_priority(PriorityLevel::Low),
        );
        assert_eq!(controller.add_waiting_operator(vec![op2.clone()]), 0);
        assert_eq!(op2.status(), OpStatus::Canceled);
        assert!(Arc::ptr_eq(&controller.get_operator(1).unwrap(), &op1));
    }

    #[test]
    fn higher_priority_replaces_the_running_operator() {
        let (cluster, sink, controller) = setup();
        let region = seed_region(&cluster, 1);

        let op1 = transfer_op(&region, 2);
        assert!(controller.add_operator(vec![op1.clone()]));
        sink.take();

        let op3 = Arc::new(
            Operator::new(
                "evict-leader",
                region.id,
                region.epoch,
                OpKind::LEADER,
                vec![OpStep::TransferLeader { to_store: 2 }],
            )
            .with_priority(PriorityLevel::Urgent),
        );
        assert_eq!(controller.add_waiting_operator(vec![op3.clone()]), 1);

        assert_eq!(op1.status(), OpStatus::Replaced);
        assert_eq!(op3.status(), OpStatus::Started);
        assert!(Arc::ptr_eq(&controller.get_operator(1).unwrap(), &op3));
        assert_eq!(controller.operator_count(OpKind::LEADER), 1);
        assert_eq!(sink.len(), 1, "replacement emits its own first command");
        assert_eq!(controller.metrics().snapshot().operators_replaced, 1);
    }

    #[test]
    fn store_limit_rejection_conserves_tokens() {
        let (cluster, _sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        // Half a region's worth of capacity: never enough for one add.
        cluster.set_limit_rate(3, StoreLimitKind::AddPeer, 0.5);

        let op = add_peer_op(&region, 13, 3);
        assert!(!controller.add_operator(vec![op.clone()]));
        assert_eq!(op.status(), OpStatus::Canceled);
        assert!(controller.get_operator(1).is_none());

        let limit = cluster
            .get_store(3)
            .unwrap()
            .store_limit(StoreLimitKind::AddPeer)
            .expect("bucket installed by the admission check");
        assert!(
            limit.available() >= 499,
            "rejected admission must not take tokens"
        );

        let record = controller.get_operator_status(1).expect("record kept");
        assert_eq!(record.status, OpStatus::Canceled);
    }

    #[test]
    fn direct_add_charges_store_limits() {
        let (cluster, _sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        cluster.set_limit_rate(3, StoreLimitKind::AddPeer, 2.0);

        let op = add_peer_op(&region, 13, 3);
        assert!(controller.add_operator(vec![op]));

        let limit = cluster
            .get_store(3)
            .unwrap()
            .store_limit(StoreLimitKind::AddPeer)
            .unwrap();
        // Capacity 2000, one region influence taken.
        assert!(limit.available() <= 1000 + 5);
    }

    #[test]
    fn waiting_quota_rejects_excess_descriptions() {
        let (cluster, _sink, controller) = setup();
        cluster.set_max_waiting(2);
        let r1 = seed_region(&cluster, 1);
        let r2 = seed_region(&cluster, 2);
        let r3 = seed_region(&cluster, 3);

        let op1 = transfer_op(&r1, 2);
        let op2 = transfer_op(&r2, 2);
        let op3 = transfer_op(&r3, 2);
        let added =
            controller.add_waiting_operator(vec![op1.clone(), op2.clone(), op3.clone()]);

        // The third unit finds the per-desc quota full at admission.
        assert_eq!(added, 2);
        assert_eq!(op3.status(), OpStatus::Canceled);
        // Promotion re-applies the quota check before decrementing, so the
        // first pull sees the bucket still at the cap and is cancelled; the
        // second then fits.
        assert_eq!(op1.status(), OpStatus::Canceled);
        assert_eq!(op2.status(), OpStatus::Started);
        assert!(controller.get_waiting_operators().is_empty());
    }

    #[test]
    fn epoch_mismatch_is_rejected() {
        let (cluster, _sink, controller) = setup();
        let region = seed_region(&cluster, 1);

        let stale_epoch = RegionEpoch {
            conf_ver: region.epoch.conf_ver + 1,
            version: region.epoch.version,
        };
        let op = Arc::new(Operator::new(
            "transfer-leader",
            region.id,
            stale_epoch,
            OpKind::LEADER,
            vec![OpStep::TransferLeader { to_store: 2 }],
        ));
        assert_eq!(controller.add_waiting_operator(vec![op.clone()]), 0);
        assert_eq!(op.status(), OpStatus::Canceled);
        assert!(controller.get_operator(1).is_none());
    }

    #[test]
    fn heartbeat_success_buries_and_caches_fast_operator() {
        let (cluster, sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);
        assert!(controller.add_operator(vec![op.clone()]));
        sink.take();

        let mut applied = region.clone();
        applied.leader = Some(applied.peers[1]);
        cluster.put_region(applied.clone());

        let before_dispatch = Instant::now();
        controller.dispatch(&applied, DISPATCH_FROM_HEARTBEAT);

        assert_eq!(op.status(), OpStatus::Success);
        assert!(controller.get_operator(1).is_none());
        let record = controller.get_operator_status(1).expect("terminal record");
        assert_eq!(record.status, OpStatus::Success);

        let history = controller.get_history(before_dispatch);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, OpHistoryKind::TransferLeader);
        assert_eq!(history[0].to_store, 2);

        // Fast-finished operators keep contributing influence for a while.
        let mut influence = OpInfluence::default();
        controller.get_fast_op_influence(cluster.as_ref() as &dyn ClusterInformer, &mut influence);
        assert_eq!(influence.get(2).expect("target store influenced").leader_count, 1);
        assert_eq!(controller.metrics().snapshot().operators_finished, 1);
    }

    #[test]
    fn stale_confver_heartbeat_cancels_the_operator() {
        let (cluster, sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        let op = add_peer_op(&region, 13, 3);
        assert!(controller.add_operator(vec![op.clone()]));
        sink.take();

        let mut advanced = region.clone();
        advanced.epoch.conf_ver += 2;
        controller.dispatch(&advanced, DISPATCH_FROM_HEARTBEAT);

        assert_eq!(op.status(), OpStatus::Canceled);
        assert!(controller.get_operator(1).is_none());
        assert_eq!(controller.metrics().snapshot().stale_operators, 1);
    }

    #[test]
    fn active_push_buries_operators_of_disappeared_regions() {
        let (cluster, _sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);
        assert!(controller.add_operator(vec![op.clone()]));

        cluster.remove_region(1);
        controller.push_operators();

        assert!(controller.get_operator(1).is_none());
        assert_eq!(op.status(), OpStatus::Canceled);
        let record = controller.get_operator_status(1).expect("record kept");
        assert_eq!(record.status, OpStatus::Canceled);
        assert_eq!(controller.metrics().snapshot().disappeared_regions, 1);
    }

    #[test]
    fn terminal_records_expire_after_the_retention_window() {
        let cfg = ControllerConfig {
            operator_status_remain_time: Duration::from_millis(50),
            ..Default::default()
        };
        let (cluster, _sink, controller) = setup_with_config(cfg);
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);
        assert!(controller.add_operator(vec![op]));

        let mut applied = region.clone();
        applied.leader = Some(applied.peers[1]);
        controller.dispatch(&applied, DISPATCH_FROM_HEARTBEAT);
        assert!(controller.get_operator_status(1).is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert!(controller.get_operator_status(1).is_none());
    }

    #[test]
    fn merge_pairs_are_admitted_and_installed_together() {
        let (cluster, sink, controller) = setup();
        let source = seed_region(&cluster, 1);
        let target = seed_region(&cluster, 2);

        let (active, passive) = merge_pair(&source, &target);
        assert_eq!(
            controller.add_waiting_operator(vec![active.clone(), passive.clone()]),
            2
        );
        assert_eq!(active.status(), OpStatus::Started);
        assert_eq!(passive.status(), OpStatus::Started);
        assert!(controller.get_operator(1).is_some());
        assert!(controller.get_operator(2).is_some());
        assert_eq!(controller.operator_count(OpKind::MERGE), 2);

        // The passive half stays quiet; only the active half commands.
        let msgs = sink.take();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0].1, SchedulePayload::Merge { .. }));
    }

    #[test]
    fn broken_merge_pairs_are_cancelled_in_bulk() {
        let (cluster, _sink, controller) = setup();
        let source = seed_region(&cluster, 1);
        let target = seed_region(&cluster, 2);
        let r3 = seed_region(&cluster, 3);

        let (orphan, _) = merge_pair(&source, &target);
        assert_eq!(controller.add_waiting_operator(vec![orphan.clone()]), 0);
        assert_eq!(orphan.status(), OpStatus::Canceled);

        let (mispaired, _) = merge_pair(&source, &target);
        let not_merge = transfer_op(&r3, 2);
        assert_eq!(
            controller.add_waiting_operator(vec![mispaired.clone(), not_merge.clone()]),
            0
        );
        assert_eq!(mispaired.status(), OpStatus::Canceled);
        assert_eq!(not_merge.status(), OpStatus::Canceled);
        assert!(controller.get_waiting_operators().is_empty());
    }

    #[test]
    fn promotion_drains_one_unit_per_call() {
        let (cluster, _sink, controller) = setup();
        let r1 = seed_region(&cluster, 1);
        let r2 = seed_region(&cluster, 2);

        let op1 = transfer_op(&r1, 2);
        let op2 = transfer_op(&r2, 2);
        assert_eq!(
            controller.add_waiting_operator(vec![op1.clone(), op2.clone()]),
            2
        );
        assert_eq!(controller.get_operators().len(), 1);
        assert_eq!(controller.get_waiting_operators().len(), 1);
        assert_eq!(op1.status(), OpStatus::Started);
        assert_eq!(op2.status(), OpStatus::Created);

        // Finishing the running operator pulls the next waiter in.
        let mut applied = r1.clone();
        applied.leader = Some(applied.peers[1]);
        controller.dispatch(&applied, DISPATCH_FROM_HEARTBEAT);

        assert_eq!(op2.status(), OpStatus::Started);
        assert!(controller.get_waiting_operators().is_empty());
        assert!(Arc::ptr_eq(&controller.get_operator(2).unwrap(), &op2));
    }

    #[test]
    fn op_influence_skips_timed_out_operators() {
        let (cluster, _sink, controller) = setup();
        let r1 = seed_region(&cluster, 1);
        let r2 = seed_region(&cluster, 2);

        let timed_out = Arc::new(
            Operator::new(
                "balance-region",
                r1.id,
                r1.epoch,
                OpKind::REGION,
                vec![OpStep::AddPeer {
                    peer_id: 13,
                    to_store: 2,
                }],
            )
            .with_timeout(Duration::ZERO),
        );
        let live = add_peer_op(&r2, 23, 3);
        assert!(controller.add_operator(vec![timed_out.clone()]));
        assert!(controller.add_operator(vec![live.clone()]));
        std::thread::sleep(Duration::from_millis(2));

        let influence = controller.get_op_influence(cluster.as_ref() as &dyn ClusterInformer);
        assert!(influence.get(2).is_none(), "timed out operator is excluded");
        let store3 = influence.get(3).expect("live operator counted");
        assert_eq!(store3.step_cost(StoreLimitKind::AddPeer), REGION_INFLUENCE);
    }

    #[test]
    fn history_is_pruned_after_the_keep_window() {
        let cfg = ControllerConfig {
            history_keep_time: Duration::from_millis(40),
            ..Default::default()
        };
        let (cluster, _sink, controller) = setup_with_config(cfg);
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);
        assert!(controller.add_operator(vec![op]));

        let t0 = Instant::now();
        let mut applied = region.clone();
        applied.leader = Some(applied.peers[1]);
        controller.dispatch(&applied, DISPATCH_FROM_HEARTBEAT);

        controller.prune_history();
        assert_eq!(controller.get_history(t0).len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        controller.prune_history();
        assert!(controller.get_history(t0).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_loop_pushes_and_can_be_shut_down() {
        let cfg = ControllerConfig {
            push_operator_tick_interval: Duration::from_millis(10),
            retention_tick_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (cluster, _sink, controller) = setup_with_config(cfg);
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);
        let controller = Arc::new(controller);
        assert!(controller.add_operator(vec![op.clone()]));

        cluster.remove_region(1);
        let handle = spawn_background(controller.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.get_operator(1).is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(controller.get_operator(1).is_none());
        assert_eq!(op.status(), OpStatus::Canceled);

        handle.shutdown().await;
    }

    #[test]
    fn operator_status_renders_to_json() {
        let (cluster, _sink, controller) = setup();
        let region = seed_region(&cluster, 1);
        let op = transfer_op(&region, 2);
        op.set_additional_info("reason", "test");
        assert!(controller.add_operator(vec![op]));

        let status = controller.get_operator_status(1).expect("live operator");
        let json = status.to_json();
        assert_eq!(json["region_id"], 1);
        assert_eq!(json["status"], "STARTED");
        assert_eq!(json["steps"][0], "transfer leader to store 2");
    }
}
