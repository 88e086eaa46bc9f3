/// Statistics tracking for the dispatcher and continuation bridges
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters, updated from the engine thread and runtime workers alike.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub(crate) dispatched: AtomicU64,
    pub(crate) fired: AtomicU64,
    pub(crate) inline_resolved: AtomicU64,
    pub(crate) suspended: AtomicU64,
    pub(crate) continuations_created: AtomicU64,
    pub(crate) continuations_replayed: AtomicU64,
    pub(crate) continuations_dropped: AtomicU64,
    pub(crate) listener_faults: AtomicU64,
    pub(crate) slow_listeners: AtomicU64,
    pub(crate) replay_faults: AtomicU64,
    pub(crate) guard_violations: AtomicU64,
    pub(crate) retriggers_suppressed: AtomicU64,
    pub(crate) retriggers_queued: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BridgeStats {
    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        BridgeStatsSnapshot {
            dispatched: read(&self.dispatched),
            fired: read(&self.fired),
            inline_resolved: read(&self.inline_resolved),
            suspended: read(&self.suspended),
            continuations_created: read(&self.continuations_created),
            continuations_replayed: read(&self.continuations_replayed),
            continuations_dropped: read(&self.continuations_dropped),
            listener_faults: read(&self.listener_faults),
            slow_listeners: read(&self.slow_listeners),
            replay_faults: read(&self.replay_faults),
            guard_violations: read(&self.guard_violations),
            retriggers_suppressed: read(&self.retriggers_suppressed),
            retriggers_queued: read(&self.retriggers_queued),
        }
    }
}

/// Serializable copy of [`BridgeStats`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatsSnapshot {
    /// Envelopes walked, in any mode
    pub dispatched: u64,
    /// Fire-and-forget envelopes
    pub fired: u64,
    /// Decision dispatches that resolved without suspending
    pub inline_resolved: u64,
    /// Decision dispatches that suspended
    pub suspended: u64,
    /// Continuation records scheduled by a bridge
    pub continuations_created: u64,
    /// Continuations that invoked the replay, whether or not it faulted
    pub continuations_replayed: u64,
    /// Continuations dropped (cancelled, subject gone, stale state)
    pub continuations_dropped: u64,
    pub listener_faults: u64,
    pub slow_listeners: u64,
    pub replay_faults: u64,
    pub guard_violations: u64,
    pub retriggers_suppressed: u64,
    pub retriggers_queued: u64,
}

impl BridgeStatsSnapshot {
    /// Decision dispatches that have not produced a continuation outcome yet.
    pub fn outstanding_continuations(&self) -> u64 {
        self.continuations_created
            .saturating_sub(self.continuations_replayed + self.continuations_dropped)
    }
}
