//! Operators: step-by-step plans that move one region between replica
//! configurations. An operator owns an immutable step list and a cursor;
//! progress is driven by `check` against successive region heartbeats.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use keyplane_core::{RegionEpoch, RegionInfo};

pub mod influence;
pub mod status;
pub mod step;
pub mod waiting;

pub use influence::{OpInfluence, StoreInfluence};
pub use status::OpStatus;
pub use step::{DemoteTarget, OpStep, PromoteTarget};
pub use waiting::RandBuckets;

use status::StatusTracker;

/// Running deadline for operators that only move leadership.
pub const LEADER_OPERATOR_WAIT_TIME: Duration = Duration::from_secs(10);
/// Running deadline for operators that move region data.
pub const REGION_OPERATOR_WAIT_TIME: Duration = Duration::from_secs(10 * 60);
/// How long a created operator may wait before it is considered dead on
/// arrival.
pub const OPERATOR_EXPIRE_TIME: Duration = Duration::from_secs(3 * 60);

bitflags! {
    /// What an operator does, as a bitset; one operator can carry several.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpKind: u16 {
        const LEADER     = 1 << 0;
        const REGION     = 1 << 1;
        const SPLIT      = 1 << 2;
        const ADMIN      = 1 << 3;
        const HOT_REGION = 1 << 4;
        const REPLICA    = 1 << 5;
        const MERGE      = 1 << 6;
        const RANGE      = 1 << 7;
    }
}

impl OpKind {
    /// The single most significant kind bit, used to attribute the operator
    /// to one scheduler family in counters.
    pub fn scheduler_kind(self) -> OpKind {
        let bits = self.bits();
        if bits == 0 {
            return OpKind::empty();
        }
        OpKind::from_bits_truncate(1 << (15 - bits.leading_zeros()))
    }
}

/// Scheduling priority band of an operator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PriorityLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Urgent = 3,
}

/// What a finished step did, for the history feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpHistoryKind {
    TransferLeader,
    AddPeer,
    RemovePeer,
    MoveRegion,
}

/// One entry of the controller's step history. A store id of zero means the
/// side is not applicable for the step kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHistory {
    pub finish_time: Instant,
    pub from_store: u64,
    pub to_store: u64,
    pub kind: OpHistoryKind,
}

/// A plan that transforms one region's replica configuration.
#[derive(Debug)]
pub struct Operator {
    desc: String,
    region_id: u64,
    region_epoch: RegionEpoch,
    kind: OpKind,
    priority: PriorityLevel,
    steps: Vec<OpStep>,
    current_step: AtomicUsize,
    step_finish_times: Mutex<Vec<Option<Instant>>>,
    status: Mutex<StatusTracker>,
    timeout: Duration,
    expire_window: Duration,
    cancel_reason: Mutex<Option<String>>,
    additional_info: Mutex<BTreeMap<String, String>>,
}

impl Operator {
    /// Build an operator over `steps`, capturing the region epoch it was
    /// planned against. The running deadline follows the kind: data-moving
    /// kinds get the long window, leadership-only kinds the short one.
    pub fn new(
        desc: impl Into<String>,
        region_id: u64,
        region_epoch: RegionEpoch,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        let timeout = if kind.intersects(OpKind::REGION | OpKind::MERGE | OpKind::SPLIT) {
            REGION_OPERATOR_WAIT_TIME
        } else {
            LEADER_OPERATOR_WAIT_TIME
        };
        let priority = if kind.contains(OpKind::ADMIN) {
            PriorityLevel::Urgent
        } else {
            PriorityLevel::Medium
        };
        let step_count = steps.len();
        Self {
            desc: desc.into(),
            region_id,
            region_epoch,
            kind,
            priority,
            steps,
            current_step: AtomicUsize::new(0),
            step_finish_times: Mutex::new(vec![None; step_count]),
            status: Mutex::new(StatusTracker::new()),
            timeout,
            expire_window: OPERATOR_EXPIRE_TIME,
            cancel_reason: Mutex::new(None),
            additional_info: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expire_window(mut self, window: Duration) -> Self {
        self.expire_window = window;
        self
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn region_epoch(&self) -> RegionEpoch {
        self.region_epoch
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn priority(&self) -> PriorityLevel {
        self.priority
    }

    pub fn scheduler_kind(&self) -> OpKind {
        self.kind.scheduler_kind()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&OpStep> {
        self.steps.get(index)
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> OpStatus {
        self.status.lock().unwrap().status()
    }

    /// Move Created -> Started. False when the operator is not fresh.
    pub fn start(&self) -> bool {
        self.status.lock().unwrap().transition_to(OpStatus::Started)
    }

    /// Cancel a non-terminal operator. False once already terminal, which
    /// makes double-cancel harmless.
    pub fn cancel(&self) -> bool {
        self.status.lock().unwrap().transition_to(OpStatus::Canceled)
    }

    /// Mark the operator displaced by a newer one for the same region.
    pub fn replace(&self) -> bool {
        self.status.lock().unwrap().transition_to(OpStatus::Replaced)
    }

    /// Advance past every step the snapshot shows as applied and return the
    /// step still in flight, if any. Success and timeout bookkeeping runs on
    /// every call, so callers should consult `status()` right after.
    pub fn check(&self, region: &RegionInfo) -> Option<OpStep> {
        if self.status().is_end() {
            return None;
        }
        let mut result = None;
        let mut idx = self.current_step.load(Ordering::SeqCst);
        while idx < self.steps.len() {
            let step = &self.steps[idx];
            if step.is_finished(region) {
                let mut times = self.step_finish_times.lock().unwrap();
                if times[idx].is_none() {
                    times[idx] = Some(Instant::now());
                }
                idx += 1;
                self.current_step.store(idx, Ordering::SeqCst);
            } else {
                result = Some(step.clone());
                break;
            }
        }
        self.check_timeout();
        result
    }

    /// Whether every step has completed; transitions Started -> Success.
    pub fn check_success(&self) -> bool {
        if self.current_step.load(Ordering::SeqCst) < self.steps.len() {
            return false;
        }
        let mut status = self.status.lock().unwrap();
        if status.status() == OpStatus::Started {
            let _ = status.transition_to(OpStatus::Success);
        }
        status.status() == OpStatus::Success
    }

    /// Whether the operator ran past its deadline; transitions to Timeout.
    pub fn check_timeout(&self) -> bool {
        if self.check_success() {
            return false;
        }
        self.status.lock().unwrap().check_timeout(self.timeout)
    }

    /// Whether the operator sat unstarted past the expiry window;
    /// transitions to Expired.
    pub fn check_expired(&self) -> bool {
        self.status.lock().unwrap().check_expired(self.expire_window)
    }

    /// Conf-ver increments the region has consumed from this plan, counting
    /// finished steps plus the current one (it may have just applied).
    pub fn conf_ver_changed(&self, region: &RegionInfo) -> u64 {
        if self.steps.is_empty() {
            return 0;
        }
        let mut current = self.current_step.load(Ordering::SeqCst);
        if current == self.steps.len() {
            current -= 1;
        }
        self.steps[..=current]
            .iter()
            .map(|step| step.conf_ver_delta(region))
            .sum()
    }

    /// Time since the operator was created.
    pub fn elapsed(&self) -> Duration {
        self.status
            .lock()
            .unwrap()
            .reach_time(OpStatus::Created)
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Time since the operator started running; zero before start.
    pub fn running_time(&self) -> Duration {
        self.status
            .lock()
            .unwrap()
            .reach_time(OpStatus::Started)
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.status.lock().unwrap().reach_time(OpStatus::Started)
    }

    /// When the operator reached its terminal status, if it has.
    pub fn finish_time(&self) -> Option<Instant> {
        let status = self.status.lock().unwrap();
        let current = status.status();
        if current.is_end() {
            status.reach_time(current)
        } else {
            None
        }
    }

    /// Record why the operator was cancelled. First writer wins.
    pub fn set_cancel_reason(&self, reason: impl Into<String>) {
        let mut slot = self.cancel_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().unwrap().clone()
    }

    /// Total projected influence of every step against each affected store.
    pub fn total_influence(&self, influence: &mut OpInfluence, region: &RegionInfo) {
        for step in &self.steps {
            step.influence(influence, region);
        }
    }

    /// Influence of the steps that have not completed yet.
    pub fn unfinished_influence(&self, influence: &mut OpInfluence, region: &RegionInfo) {
        let current = self.current_step.load(Ordering::SeqCst);
        for step in &self.steps[current.min(self.steps.len())..] {
            step.influence(influence, region);
        }
    }

    /// Step-history entries for the feed: add/remove pairs collapse into a
    /// region move, the rest keep their own kind.
    pub fn history(&self) -> Vec<OpHistory> {
        let finish_time = Instant::now();
        let mut histories = Vec::new();
        let mut added_stores = Vec::new();
        for step in &self.steps {
            match step {
                OpStep::TransferLeader { to_store } => histories.push(OpHistory {
                    finish_time,
                    from_store: 0,
                    to_store: *to_store,
                    kind: OpHistoryKind::TransferLeader,
                }),
                OpStep::AddPeer { to_store, .. } | OpStep::AddLearner { to_store, .. } => {
                    added_stores.push(*to_store);
                }
                OpStep::RemovePeer { from_store } => match added_stores.pop() {
                    Some(to_store) => histories.push(OpHistory {
                        finish_time,
                        from_store: *from_store,
                        to_store,
                        kind: OpHistoryKind::MoveRegion,
                    }),
                    None => histories.push(OpHistory {
                        finish_time,
                        from_store: *from_store,
                        to_store: 0,
                        kind: OpHistoryKind::RemovePeer,
                    }),
                },
                _ => {}
            }
        }
        for to_store in added_stores {
            histories.push(OpHistory {
                finish_time,
                from_store: 0,
                to_store,
                kind: OpHistoryKind::AddPeer,
            });
        }
        histories
    }

    /// Attach a free-form note carried into logs and status records.
    pub fn set_additional_info(&self, key: impl Into<String>, value: impl Into<String>) {
        self.additional_info
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// Additional info rendered as a JSON object, empty string when unset.
    pub fn additional_info_json(&self) -> String {
        let info = self.additional_info.lock().unwrap();
        if info.is_empty() {
            return String::new();
        }
        serde_json::to_string(&*info).unwrap_or_default()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (kind: {:?}, region: {}({}, {}), step {}/{}: [",
            self.desc,
            self.kind,
            self.region_id,
            self.region_epoch.version,
            self.region_epoch.conf_ver,
            self.current_step.load(Ordering::SeqCst),
            self.steps.len(),
        )?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{step}")?;
        }
        write!(f, "])")
    }
}
