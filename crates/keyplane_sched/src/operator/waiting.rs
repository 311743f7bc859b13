//! Priority-banded holding tank for admitted-but-not-yet-running operators.
//!
//! One FIFO band per priority level. Retrieval picks a band at random with
//! probability proportional to its weight among the non-empty bands, so low
//! priority work still drains while urgent work dominates.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;

use crate::operator::{OpKind, Operator, PriorityLevel};

/// Band weights indexed by `PriorityLevel as usize` (Low..Urgent).
const PRIORITY_WEIGHTS: [f64; 4] = [1.0, 4.0, 9.0, 16.0];

#[derive(Debug)]
struct Band {
    priority: PriorityLevel,
    weight: f64,
    ops: VecDeque<Arc<Operator>>,
}

/// Waiting bucket with weighted random selection across priority bands.
#[derive(Debug)]
pub struct RandBuckets {
    buckets: Vec<Band>,
    total_weight: f64,
}

impl Default for RandBuckets {
    fn default() -> Self {
        Self::new()
    }
}

impl RandBuckets {
    pub fn new() -> Self {
        let buckets = [
            PriorityLevel::Urgent,
            PriorityLevel::High,
            PriorityLevel::Medium,
            PriorityLevel::Low,
        ]
        .into_iter()
        .map(|priority| Band {
            priority,
            weight: PRIORITY_WEIGHTS[priority as usize],
            ops: VecDeque::new(),
        })
        .collect();
        Self {
            buckets,
            total_weight: 0.0,
        }
    }

    /// Append an operator to its priority band. The two halves of a merge
    /// pair must be put back to back so retrieval can take them together.
    pub fn put_operator(&mut self, op: Arc<Operator>) {
        let priority = op.priority();
        for band in &mut self.buckets {
            if band.priority != priority {
                continue;
            }
            if band.ops.is_empty() {
                self.total_weight += band.weight;
            }
            band.ops.push_back(op);
            return;
        }
    }

    /// Take one operator, or a merge pair, from a randomly weighted band.
    pub fn get_operator(&mut self) -> Option<Vec<Arc<Operator>>> {
        if self.total_weight <= 0.0 {
            return None;
        }
        let r: f64 = rand::thread_rng().gen();
        let mut sum = 0.0;
        let mut pick = None;
        for (idx, band) in self.buckets.iter().enumerate() {
            if band.ops.is_empty() {
                continue;
            }
            let proportion = band.weight / self.total_weight;
            if r >= sum && r < sum + proportion {
                pick = Some(idx);
                break;
            }
            sum += proportion;
            // Rounding can leave the last band just out of reach.
            pick = Some(idx);
        }
        let band = &mut self.buckets[pick?];

        let first = band.ops.pop_front()?;
        let mut unit = vec![first];
        if unit[0].kind().contains(OpKind::MERGE) {
            let second = band
                .ops
                .pop_front()
                .expect("merge operators are enqueued in pairs");
            unit.push(second);
        }
        if band.ops.is_empty() {
            self.total_weight -= band.weight;
        }
        Some(unit)
    }

    /// Snapshot of everything waiting, highest priority band first.
    pub fn list_operators(&self) -> Vec<Arc<Operator>> {
        self.buckets
            .iter()
            .flat_map(|band| band.ops.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|band| band.ops.is_empty())
    }
}
