//! Operator lifecycle status machine.
//!
//! Valid transitions:
//! `Created -> Started -> {Success, Timeout, Replaced, Canceled}` plus
//! `Created -> {Canceled, Replaced, Expired}`. Every transition is
//! single-shot; illegal requests are refused rather than clobbering state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lifecycle state of an operator. The starred states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Created,
    Started,
    Success,
    Canceled,
    Replaced,
    Expired,
    Timeout,
}

impl OpStatus {
    /// Whether the status is terminal.
    pub fn is_end(self) -> bool {
        matches!(
            self,
            OpStatus::Success
                | OpStatus::Canceled
                | OpStatus::Replaced
                | OpStatus::Expired
                | OpStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Created => "CREATED",
            OpStatus::Started => "STARTED",
            OpStatus::Success => "SUCCESS",
            OpStatus::Canceled => "CANCELED",
            OpStatus::Replaced => "REPLACED",
            OpStatus::Expired => "EXPIRED",
            OpStatus::Timeout => "TIMEOUT",
        }
    }

    fn index(self) -> usize {
        match self {
            OpStatus::Created => 0,
            OpStatus::Started => 1,
            OpStatus::Success => 2,
            OpStatus::Canceled => 3,
            OpStatus::Replaced => 4,
            OpStatus::Expired => 5,
            OpStatus::Timeout => 6,
        }
    }
}

const STATUS_COUNT: usize = 7;

/// Tracks the current status and when each status was reached.
#[derive(Debug)]
pub(crate) struct StatusTracker {
    current: OpStatus,
    reach_times: [Option<Instant>; STATUS_COUNT],
}

impl StatusTracker {
    pub(crate) fn new() -> Self {
        let mut reach_times = [None; STATUS_COUNT];
        reach_times[OpStatus::Created.index()] = Some(Instant::now());
        Self {
            current: OpStatus::Created,
            reach_times,
        }
    }

    pub(crate) fn status(&self) -> OpStatus {
        self.current
    }

    /// When `status` was entered, if it ever was.
    pub(crate) fn reach_time(&self, status: OpStatus) -> Option<Instant> {
        self.reach_times[status.index()]
    }

    /// Attempt a transition to `next`. Returns false and leaves the state
    /// untouched when the transition is not allowed from the current status.
    pub(crate) fn transition_to(&mut self, next: OpStatus) -> bool {
        let allowed = match (self.current, next) {
            (OpStatus::Created, OpStatus::Started)
            | (OpStatus::Created, OpStatus::Canceled)
            | (OpStatus::Created, OpStatus::Replaced)
            | (OpStatus::Created, OpStatus::Expired)
            | (OpStatus::Started, OpStatus::Success)
            | (OpStatus::Started, OpStatus::Canceled)
            | (OpStatus::Started, OpStatus::Replaced)
            | (OpStatus::Started, OpStatus::Timeout) => true,
            _ => false,
        };
        if allowed {
            self.current = next;
            self.reach_times[next.index()] = Some(Instant::now());
        }
        allowed
    }

    /// Expire the operator when it sat in Created longer than `window`.
    /// Returns whether the status is Expired afterwards.
    pub(crate) fn check_expired(&mut self, window: Duration) -> bool {
        if self.current == OpStatus::Created {
            let created = self.reach_times[OpStatus::Created.index()].expect("created is stamped");
            if created.elapsed() > window {
                let _ = self.transition_to(OpStatus::Expired);
            }
        }
        self.current == OpStatus::Expired
    }

    /// Time out the operator when it ran longer than `timeout`. Returns
    /// whether the status is Timeout afterwards.
    pub(crate) fn check_timeout(&mut self, timeout: Duration) -> bool {
        if self.current == OpStatus::Started {
            let started = self.reach_times[OpStatus::Started.index()].expect("started is stamped");
            if started.elapsed() > timeout {
                let _ = self.transition_to(OpStatus::Timeout);
            }
        }
        self.current == OpStatus::Timeout
    }
}
