//! Core data model for the keyplane placement driver: region descriptors,
//! the keyed range index, and per-store scheduling rate limits.

pub mod basic_cluster;
pub mod region;
pub mod region_tree;
pub mod store;
pub mod store_limit;

pub use basic_cluster::BasicCluster;
pub use region::{
    key_in_range, region_involved, Key, KeyRange, Peer, PeerRole, RegionEpoch, RegionInfo,
    EMPTY_REGION_APPROXIMATE_SIZE,
};
pub use region_tree::RegionTree;
pub use store::{StoreInfo, StoreState};
pub use store_limit::{StoreLimit, StoreLimitKind, REGION_INFLUENCE};
