//! Token-bucket rate limits for per-store scheduling capacity.
//!
//! Each store carries one bucket per limit kind. Admission control checks
//! `available()` and charges `take()`; tokens regenerate continuously at the
//! configured rate and are never credited back when an operator retires.

use std::sync::Mutex;
use std::time::Instant;

/// Influence charged against a store for scheduling one region's peer.
pub const REGION_INFLUENCE: i64 = 1000;

/// The kinds of peer movement a store limits independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLimitKind {
    AddPeer,
    RemovePeer,
}

impl StoreLimitKind {
    pub const ALL: [StoreLimitKind; 2] = [StoreLimitKind::AddPeer, StoreLimitKind::RemovePeer];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreLimitKind::AddPeer => "add-peer",
            StoreLimitKind::RemovePeer => "remove-peer",
        }
    }
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
}

/// A token bucket: `rate_per_sec` tokens accrue continuously, capped at
/// `capacity`. The bucket starts full.
#[derive(Debug)]
pub struct StoreLimit {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl StoreLimit {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            rate_per_sec: rate_per_sec.max(0.0),
            capacity,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The refill rate this bucket was built with, in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate_per_sec
    }

    /// Tokens currently available, after refilling for elapsed time.
    pub fn available(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        state.available.floor() as i64
    }

    /// Charge `count` tokens. The caller is expected to have checked
    /// `available()` first; the balance saturates at zero regardless.
    pub fn take(&self, count: i64) {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        state.available = (state.available - count as f64).max(0.0);
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.available = (state.available + elapsed * self.rate_per_sec).min(self.capacity);
    }
}
