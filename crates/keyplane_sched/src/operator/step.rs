//! Operator steps: single atomic transformations applied to a region.
//!
//! Progress is only ever observed through heartbeats, so every variant knows
//! how to recognize its own completion in a region snapshot, how to detect
//! that it can no longer make progress, and how to project itself into an
//! outbound schedule command.

use std::fmt;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use keyplane_core::{Key, Peer, PeerRole, RegionInfo, StoreLimitKind, REGION_INFLUENCE};

use crate::cluster::ClusterInformer;
use crate::heartbeat::{ConfChangeType, PeerChange, SchedulePayload, SplitPolicy};
use crate::operator::influence::OpInfluence;

/// A learner to be promoted inside a joint-consensus batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteTarget {
    pub peer_id: u64,
    pub to_store: u64,
}

/// A voter to be demoted inside a joint-consensus batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoteTarget {
    pub peer_id: u64,
    pub from_store: u64,
}

/// One step of an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpStep {
    TransferLeader {
        to_store: u64,
    },
    AddPeer {
        peer_id: u64,
        to_store: u64,
    },
    AddLearner {
        peer_id: u64,
        to_store: u64,
    },
    PromoteLearner {
        peer_id: u64,
        to_store: u64,
    },
    DemoteFollower {
        peer_id: u64,
        to_store: u64,
    },
    RemovePeer {
        from_store: u64,
    },
    MergeRegion {
        /// Descriptor of the region this operator drives, captured at plan
        /// time; the passive side recognizes completion by its range moving.
        from: Box<RegionInfo>,
        /// The region absorbing the data.
        target: Box<RegionInfo>,
        /// The passive half waits; the active half sends the merge command.
        is_passive: bool,
    },
    SplitRegion {
        policy: SplitPolicy,
        keys: Vec<Key>,
        /// Region version captured at plan time; any version bump past this
        /// means the split happened.
        start_version: u64,
    },
    ChangePeerV2Enter {
        promotes: Vec<PromoteTarget>,
        demotes: Vec<DemoteTarget>,
    },
    ChangePeerV2Leave,
}

impl OpStep {
    /// Whether the region snapshot shows this step as applied.
    pub fn is_finished(&self, region: &RegionInfo) -> bool {
        match self {
            OpStep::TransferLeader { to_store } => region.leader_store_id() == Some(*to_store),
            OpStep::AddPeer { peer_id, to_store } => region
                .store_voter(*to_store)
                .is_some_and(|p| p.id == *peer_id && region.pending_peer(p.id).is_none()),
            OpStep::AddLearner { peer_id, to_store } => region
                .store_learner(*to_store)
                .is_some_and(|p| p.id == *peer_id && region.pending_peer(p.id).is_none()),
            OpStep::PromoteLearner { peer_id, to_store } => region
                .store_voter(*to_store)
                .is_some_and(|p| p.id == *peer_id),
            OpStep::DemoteFollower { peer_id, to_store } => region
                .store_learner(*to_store)
                .is_some_and(|p| p.id == *peer_id),
            OpStep::RemovePeer { from_store } => region.store_peer(*from_store).is_none(),
            OpStep::MergeRegion {
                from, is_passive, ..
            } => {
                // Only the passive side observes completion directly: its
                // range is rewritten once the merge commits.
                *is_passive
                    && (region.start_key != from.start_key || region.end_key != from.end_key)
            }
            OpStep::SplitRegion { start_version, .. } => region.epoch.version > *start_version,
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                promotes.iter().all(|t| {
                    region
                        .peer(t.peer_id)
                        .is_some_and(|p| p.store_id == t.to_store && p.role == PeerRole::IncomingVoter)
                }) && demotes.iter().all(|t| {
                    region.peer(t.peer_id).is_some_and(|p| {
                        p.store_id == t.from_store && p.role == PeerRole::DemotingVoter
                    })
                })
            }
            OpStep::ChangePeerV2Leave => region
                .peers
                .iter()
                .all(|p| matches!(p.role, PeerRole::Voter | PeerRole::Learner)),
        }
    }

    /// Validate that the step can still make progress against the current
    /// cluster view. An error marks the owning operator stale.
    pub fn check_in_progress(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
    ) -> anyhow::Result<()> {
        match self {
            OpStep::TransferLeader { to_store } => {
                check_store_up(cluster, *to_store)?;
                if region.store_voter(*to_store).is_none() {
                    bail!("no voter peer on store {to_store} to receive leadership");
                }
                Ok(())
            }
            OpStep::AddPeer { peer_id, to_store } | OpStep::AddLearner { peer_id, to_store } => {
                check_store_up(cluster, *to_store)?;
                if let Some(peer) = region.store_peer(*to_store) {
                    if peer.id != *peer_id {
                        bail!("store {to_store} already hosts peer {}", peer.id);
                    }
                }
                Ok(())
            }
            OpStep::PromoteLearner { peer_id, .. } => {
                if region.peer(*peer_id).is_none() {
                    bail!("peer {peer_id} to promote is gone");
                }
                Ok(())
            }
            OpStep::DemoteFollower { peer_id, .. } => {
                if region.peer(*peer_id).is_none() {
                    bail!("peer {peer_id} to demote is gone");
                }
                if region.leader.is_some_and(|l| l.id == *peer_id) {
                    bail!("cannot demote leader peer {peer_id}");
                }
                Ok(())
            }
            OpStep::RemovePeer { from_store } => {
                if region.leader_store_id() == Some(*from_store) {
                    bail!("cannot remove leader peer on store {from_store}");
                }
                Ok(())
            }
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                for t in promotes {
                    if region.peer(t.peer_id).is_none() {
                        bail!("peer {} to promote is gone", t.peer_id);
                    }
                }
                for t in demotes {
                    if region.peer(t.peer_id).is_none() {
                        bail!("peer {} to demote is gone", t.peer_id);
                    }
                    if region.leader.is_some_and(|l| l.id == t.peer_id) {
                        bail!("cannot demote leader peer {}", t.peer_id);
                    }
                }
                Ok(())
            }
            OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. } | OpStep::ChangePeerV2Leave => {
                Ok(())
            }
        }
    }

    /// How many conf-ver increments this step accounts for in the snapshot.
    pub fn conf_ver_delta(&self, region: &RegionInfo) -> u64 {
        let applied = match self {
            OpStep::AddPeer { peer_id, to_store } | OpStep::PromoteLearner { peer_id, to_store } => {
                region
                    .store_voter(*to_store)
                    .is_some_and(|p| p.id == *peer_id)
            }
            // Any role counts: a learner that was promoted later in the plan
            // still consumed this step's conf-ver increment.
            OpStep::AddLearner { peer_id, to_store } => region
                .store_peer(*to_store)
                .is_some_and(|p| p.id == *peer_id),
            OpStep::DemoteFollower { peer_id, to_store } => region
                .store_learner(*to_store)
                .is_some_and(|p| p.id == *peer_id),
            OpStep::RemovePeer { from_store } => region.store_peer(*from_store).is_none(),
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                let p = promotes.iter().filter(|t| {
                    region.peer(t.peer_id).is_some_and(|p| {
                        matches!(p.role, PeerRole::IncomingVoter | PeerRole::Voter)
                    })
                });
                let d = demotes.iter().filter(|t| {
                    region.peer(t.peer_id).is_some_and(|p| {
                        matches!(p.role, PeerRole::DemotingVoter | PeerRole::Learner)
                    })
                });
                return (p.count() + d.count()) as u64;
            }
            OpStep::ChangePeerV2Leave => region
                .peers
                .iter()
                .all(|p| matches!(p.role, PeerRole::Voter | PeerRole::Learner)),
            OpStep::TransferLeader { .. }
            | OpStep::MergeRegion { .. }
            | OpStep::SplitRegion { .. } => false,
        };
        u64::from(applied)
    }

    /// Account this step's projected cost against the affected stores.
    pub fn influence(&self, influence: &mut OpInfluence, region: &RegionInfo) {
        let size = region.approximate_size as i64;
        match self {
            OpStep::TransferLeader { to_store } => {
                if let Some(from_store) = region.leader_store_id() {
                    if from_store != *to_store {
                        let from = influence.store_influence(from_store);
                        from.leader_size -= size;
                        from.leader_count -= 1;
                    }
                }
                let to = influence.store_influence(*to_store);
                to.leader_size += size;
                to.leader_count += 1;
            }
            OpStep::AddPeer { to_store, .. } | OpStep::AddLearner { to_store, .. } => {
                let to = influence.store_influence(*to_store);
                to.region_size += size;
                to.region_count += 1;
                to.add_step_cost(StoreLimitKind::AddPeer, REGION_INFLUENCE);
            }
            OpStep::RemovePeer { from_store } => {
                let from = influence.store_influence(*from_store);
                from.region_size -= size;
                from.region_count -= 1;
                from.add_step_cost(StoreLimitKind::RemovePeer, REGION_INFLUENCE);
            }
            OpStep::MergeRegion { is_passive, .. } => {
                if *is_passive {
                    for peer in &region.peers {
                        let store = influence.store_influence(peer.store_id);
                        store.region_size -= size;
                        store.region_count -= 1;
                        if region.leader_store_id() == Some(peer.store_id) {
                            store.leader_size -= size;
                            store.leader_count -= 1;
                        }
                    }
                }
            }
            OpStep::PromoteLearner { .. }
            | OpStep::DemoteFollower { .. }
            | OpStep::SplitRegion { .. }
            | OpStep::ChangePeerV2Enter { .. }
            | OpStep::ChangePeerV2Leave => {}
        }
    }

    /// Project the step into an outbound command, or `None` when nothing
    /// needs to be sent for the current snapshot.
    pub fn command(&self, region: &RegionInfo) -> Option<SchedulePayload> {
        match self {
            OpStep::TransferLeader { to_store } => {
                let Some(peer) = region.store_peer(*to_store) else {
                    tracing::error!(
                        region_id = region.id,
                        to_store,
                        "transfer leader target has no peer"
                    );
                    return None;
                };
                Some(SchedulePayload::TransferLeader { peer: *peer })
            }
            OpStep::AddPeer { peer_id, to_store } => {
                if region.store_peer(*to_store).is_some() {
                    // The newly added peer is pending.
                    return None;
                }
                Some(SchedulePayload::ChangePeer {
                    change_type: ConfChangeType::AddNode,
                    peer: Peer::new(*peer_id, *to_store),
                })
            }
            OpStep::AddLearner { peer_id, to_store } => {
                if region.store_peer(*to_store).is_some() {
                    // The newly added peer is pending.
                    return None;
                }
                Some(SchedulePayload::ChangePeer {
                    change_type: ConfChangeType::AddLearnerNode,
                    peer: Peer::learner(*peer_id, *to_store),
                })
            }
            OpStep::PromoteLearner { peer_id, to_store } => Some(SchedulePayload::ChangePeer {
                change_type: ConfChangeType::AddNode,
                peer: Peer::new(*peer_id, *to_store),
            }),
            OpStep::DemoteFollower { peer_id, to_store } => Some(SchedulePayload::ChangePeer {
                change_type: ConfChangeType::AddLearnerNode,
                peer: Peer::learner(*peer_id, *to_store),
            }),
            OpStep::RemovePeer { from_store } => {
                let Some(peer) = region.store_peer(*from_store) else {
                    tracing::error!(
                        region_id = region.id,
                        from_store,
                        "peer to remove is already gone"
                    );
                    return None;
                };
                Some(SchedulePayload::ChangePeer {
                    change_type: ConfChangeType::RemoveNode,
                    peer: *peer,
                })
            }
            OpStep::MergeRegion {
                target, is_passive, ..
            } => {
                if *is_passive {
                    // The active side drives both halves of the merge.
                    return None;
                }
                Some(SchedulePayload::Merge {
                    target: (**target).clone(),
                })
            }
            OpStep::SplitRegion { policy, keys, .. } => Some(SchedulePayload::SplitRegion {
                policy: *policy,
                keys: keys.clone(),
            }),
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                let mut changes = Vec::with_capacity(promotes.len() + demotes.len());
                for t in promotes {
                    changes.push(PeerChange {
                        change_type: ConfChangeType::AddNode,
                        peer: Peer::new(t.peer_id, t.to_store),
                    });
                }
                for t in demotes {
                    changes.push(PeerChange {
                        change_type: ConfChangeType::AddLearnerNode,
                        peer: Peer::learner(t.peer_id, t.from_store),
                    });
                }
                Some(SchedulePayload::ChangePeerV2 { changes })
            }
            OpStep::ChangePeerV2Leave => {
                Some(SchedulePayload::ChangePeerV2 { changes: Vec::new() })
            }
        }
    }

    /// Steps that usually apply within a raft tick get the fast push cadence.
    pub fn is_fast_step(&self) -> bool {
        matches!(
            self,
            OpStep::TransferLeader { .. }
                | OpStep::PromoteLearner { .. }
                | OpStep::DemoteFollower { .. }
                | OpStep::ChangePeerV2Enter { .. }
                | OpStep::ChangePeerV2Leave
        )
    }
}

fn check_store_up(cluster: &dyn ClusterInformer, store_id: u64) -> anyhow::Result<()> {
    match cluster.get_store(store_id) {
        Some(store) if store.is_up() => Ok(()),
        Some(_) => bail!("store {store_id} is not up"),
        None => bail!("store {store_id} not found"),
    }
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::TransferLeader { to_store } => write!(f, "transfer leader to store {to_store}"),
            OpStep::AddPeer { peer_id, to_store } => {
                write!(f, "add peer {peer_id} on store {to_store}")
            }
            OpStep::AddLearner { peer_id, to_store } => {
                write!(f, "add learner {peer_id} on store {to_store}")
            }
            OpStep::PromoteLearner { peer_id, to_store } => {
                write!(f, "promote learner {peer_id} on store {to_store}")
            }
            OpStep::DemoteFollower { peer_id, to_store } => {
                write!(f, "demote follower {peer_id} on store {to_store}")
            }
            OpStep::RemovePeer { from_store } => write!(f, "remove peer on store {from_store}"),
            OpStep::MergeRegion {
                target, is_passive, ..
            } => {
                if *is_passive {
                    write!(f, "wait to be merged into region {}", target.id)
                } else {
                    write!(f, "merge into region {}", target.id)
                }
            }
            OpStep::SplitRegion { policy, .. } => write!(f, "split region with policy {policy:?}"),
            OpStep::ChangePeerV2Enter { promotes, demotes } => write!(
                f,
                "enter joint state, promote {} learner(s), demote {} voter(s)",
                promotes.len(),
                demotes.len()
            ),
            OpStep::ChangePeerV2Leave => write!(f, "leave joint state"),
        }
    }
}
