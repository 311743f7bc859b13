//! Scheduling layer of the keyplane placement driver: the operator model
//! and the operator controller that admits, dispatches, and retires
//! operators against live region heartbeats.

pub mod cache;
pub mod cluster;
pub mod controller;
pub mod healthy;
pub mod heartbeat;
pub mod metrics;
pub mod operator;

#[cfg(test)]
pub(crate) mod test_util;

pub use cluster::ClusterInformer;
pub use controller::{
    spawn_background, total_op_influence, ControllerConfig, ControllerHandle,
    OperatorController, OperatorWithStatus, DISPATCH_FROM_CREATE, DISPATCH_FROM_HEARTBEAT,
    DISPATCH_FROM_NOTIFIER_QUEUE,
};
pub use healthy::{
    allow_balance_empty_region, is_empty_region_allow_balance, is_region_healthy,
    is_region_healthy_allow_pending, is_region_replicated, replicated_region,
    BALANCE_EMPTY_REGION_THRESHOLD,
};
pub use heartbeat::{ConfChangeType, HeartbeatSink, PeerChange, SchedulePayload, SplitPolicy};
pub use metrics::{ControllerMetrics, ControllerMetricsSnapshot};
pub use operator::{
    DemoteTarget, OpHistory, OpHistoryKind, OpInfluence, OpKind, OpStatus, OpStep, Operator,
    PriorityLevel, PromoteTarget, RandBuckets, StoreInfluence, LEADER_OPERATOR_WAIT_TIME,
    OPERATOR_EXPIRE_TIME, REGION_OPERATOR_WAIT_TIME,
};
