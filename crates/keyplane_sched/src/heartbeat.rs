//! Outbound heartbeat-response commands and the sink they are delivered to.
//!
//! Stores learn about scheduling decisions exclusively through these
//! payloads, piggybacked on their next region heartbeat response.

use serde::{Deserialize, Serialize};

use keyplane_core::{Key, Peer, RegionInfo};

/// Raft configuration change applied to a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeType {
    AddNode,
    AddLearnerNode,
    RemoveNode,
}

/// How a store should pick the split keys it reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitPolicy {
    Scan,
    Approximate,
    UseKey,
}

/// One membership change inside a joint-consensus batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChange {
    pub change_type: ConfChangeType,
    pub peer: Peer,
}

/// A scheduling command for one region. Exactly one variant per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulePayload {
    TransferLeader {
        peer: Peer,
    },
    ChangePeer {
        change_type: ConfChangeType,
        peer: Peer,
    },
    ChangePeerV2 {
        changes: Vec<PeerChange>,
    },
    Merge {
        target: RegionInfo,
    },
    SplitRegion {
        policy: SplitPolicy,
        keys: Vec<Key>,
    },
}

/// Delivery seam towards the store heartbeat streams. Implementations must
/// not block the caller; buffer or drop instead.
pub trait HeartbeatSink: Send + Sync {
    fn send_msg(&self, region: &RegionInfo, payload: SchedulePayload);
}
