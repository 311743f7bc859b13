//! Region descriptors and peer metadata. Key ranges are lexicographic and
//! end-exclusive; an empty end key means "to the end of the keyspace".

use serde::{Deserialize, Serialize};

/// Raw region key. Compared bytewise (unsigned lexicographic).
pub type Key = Vec<u8>;

/// Approximate size of a region considered empty, in MiB.
pub const EMPTY_REGION_APPROXIMATE_SIZE: u64 = 1;

/// Region configuration epoch. `conf_ver` increases on peer membership
/// changes, `version` increases on split/merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// Replica role. The two joint-consensus roles only appear while a
/// `ChangePeerV2` membership change is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Voter,
    Learner,
    IncomingVoter,
    DemotingVoter,
}

impl PeerRole {
    /// True for roles that vote in the current configuration.
    pub fn is_voter(self) -> bool {
        matches!(self, PeerRole::Voter | PeerRole::IncomingVoter)
    }
}

/// One replica of a region placed on a specific store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
    pub role: PeerRole,
}

impl Peer {
    pub fn new(id: u64, store_id: u64) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(id: u64, store_id: u64) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }
}

/// A key range `[start_key, end_key)`. Empty `end_key` is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start_key: Key,
    pub end_key: Key,
}

impl KeyRange {
    pub fn new(start_key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// The full keyspace.
    pub fn everything() -> Self {
        Self::default()
    }
}

/// Point-in-time descriptor of a region as reported by store heartbeats.
/// Replaced wholesale on every heartbeat, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: u64,
    pub start_key: Key,
    pub end_key: Key,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<Peer>,
    pub pending_peers: Vec<Peer>,
    pub down_peers: Vec<Peer>,
    /// Approximate on-disk size in MiB.
    pub approximate_size: u64,
    /// Recent write throughput in bytes per second.
    pub write_bytes_rate: f64,
    /// Recent write throughput in keys per second.
    pub write_keys_rate: f64,
}

impl RegionInfo {
    pub fn new(id: u64, start_key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            ..Default::default()
        }
    }

    /// Whether `key` falls inside this region's range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start_key, &self.end_key)
    }

    /// The peer hosted on `store_id`, regardless of role.
    pub fn store_peer(&self, store_id: u64) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    /// The voting peer hosted on `store_id`, if any.
    pub fn store_voter(&self, store_id: u64) -> Option<&Peer> {
        self.peers
            .iter()
            .find(|p| p.store_id == store_id && p.role.is_voter())
    }

    /// The learner peer hosted on `store_id`, if any.
    pub fn store_learner(&self, store_id: u64) -> Option<&Peer> {
        self.peers
            .iter()
            .find(|p| p.store_id == store_id && p.role == PeerRole::Learner)
    }

    pub fn peer(&self, peer_id: u64) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.role.is_voter())
    }

    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.role == PeerRole::Learner)
    }

    /// The pending peer with `peer_id`, if the replica is still catching up.
    pub fn pending_peer(&self, peer_id: u64) -> Option<&Peer> {
        self.pending_peers.iter().find(|p| p.id == peer_id)
    }

    pub fn leader_store_id(&self) -> Option<u64> {
        self.leader.map(|p| p.store_id)
    }
}

/// Range containment check honoring the unbounded empty end key.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    let lower_ok = start.is_empty() || key >= start;
    let upper_ok = end.is_empty() || key < end;
    lower_ok && upper_ok
}

/// Whether `region` lies entirely inside `[start_key, end_key)`. A region
/// with an unbounded end never fits a bounded range.
pub fn region_involved(region: &RegionInfo, start_key: &[u8], end_key: &[u8]) -> bool {
    region.start_key.as_slice() >= start_key
        && (end_key.is_empty()
            || (!region.end_key.is_empty() && region.end_key.as_slice() <= end_key))
}
