//! Store descriptors and their scheduling rate limits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::store_limit::{StoreLimit, StoreLimitKind};

/// Lifecycle state of a store node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    Up,
    Offline,
    Tombstone,
}

/// A node hosting region peers. Snapshot clones share the same underlying
/// limit buckets, so charging tokens through one clone is visible to all.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub id: u64,
    pub state: StoreState,
    limits: Arc<Mutex<HashMap<StoreLimitKind, Arc<StoreLimit>>>>,
}

impl StoreInfo {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: StoreState::Up,
            limits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == StoreState::Up
    }

    /// The live limit bucket for `kind`, if one has been installed.
    pub fn store_limit(&self, kind: StoreLimitKind) -> Option<Arc<StoreLimit>> {
        self.limits.lock().unwrap().get(&kind).cloned()
    }

    /// Install a fresh bucket for `kind`, discarding any accumulated balance.
    pub fn reset_store_limit(&self, kind: StoreLimitKind, rate_per_sec: f64, capacity: f64) {
        self.limits
            .lock()
            .unwrap()
            .insert(kind, Arc::new(StoreLimit::new(rate_per_sec, capacity)));
    }
}
