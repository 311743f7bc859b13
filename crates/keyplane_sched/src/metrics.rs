//! In-process counters for operator lifecycle events.
//!
//! Lock-free so dispatch and admission paths can bump them while holding the
//! controller lock without extra contention. A scrape layer can snapshot and
//! export them; this crate only counts.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Controller event counters.
        #[derive(Debug, Default)]
        pub struct ControllerMetrics {
            $($(#[$doc])* $name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct ControllerMetricsSnapshot {
            $(pub $name: u64,)*
        }

        impl ControllerMetrics {
            pub fn new() -> Self {
                Self::default()
            }

            $(pub(crate) fn $name(&self) {
                self.$name.fetch_add(1, Ordering::Relaxed);
            })*

            pub fn snapshot(&self) -> ControllerMetricsSnapshot {
                ControllerMetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Operators transitioned to Started and installed as running.
    operators_started,
    /// Operators buried with Success.
    operators_finished,
    /// Operators displaced by a higher-priority replacement.
    operators_replaced,
    /// Operators buried with Timeout.
    operators_timed_out,
    /// Operators buried with Canceled.
    operators_canceled,
    /// Operators rejected because they expired before starting.
    operators_expired,
    /// Operators removed from the running set.
    operators_removed,
    /// Running operators discarded as stale during heartbeat dispatch.
    stale_operators,
    /// Operators buried because their region left the cluster view.
    disappeared_regions,
    /// Lifecycle transitions observed in an impossible state.
    unexpected_status,
    /// Operators accepted into the waiting bucket.
    waiting_added,
    /// Operators promoted from waiting to running.
    waiting_promoted,
    /// Waiting operators cancelled at promotion time.
    waiting_rejected,
    /// Admission checks that rejected a unit.
    admission_rejected,
    /// Schedule commands handed to the heartbeat sink.
    commands_sent,
    /// Operators that finished inside the fast-finish window.
    fast_finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumped_counters() {
        let metrics = ControllerMetrics::new();
        metrics.operators_started();
        metrics.operators_started();
        metrics.commands_sent();
        let snap = metrics.snapshot();
        assert_eq!(snap.operators_started, 2);
        assert_eq!(snap.commands_sent, 1);
        assert_eq!(snap.operators_finished, 0);
    }
}
