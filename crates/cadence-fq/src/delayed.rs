//! # Delayed Flows
//!
//! Time-ordered index of throttled flows. A flow lands here when its next
//! packet's effective send time is in the future; it leaves, onto the
//! old-flows list, once that instant has passed.
//!
//! `next_due` caches the earliest deadline so an idle scheduler can tell
//! its host when to wake up without walking the tree. It is lowered on
//! insert and recomputed on drain; removals may leave it conservatively
//! early, which at worst causes one spurious drain attempt.

use std::collections::BTreeSet;

use crate::table::FlowHandle;

pub struct DelayedFlows {
    tree: BTreeSet<(u64, FlowHandle)>,
    /// Earliest `time_next_packet` across the tree; `u64::MAX` when empty.
    next_due: u64,
    /// 1/8-weight moving average of how late flows leave past their
    /// scheduled instant. Observability only.
    unthrottle_latency_ns: u64,
}

impl DelayedFlows {
    pub fn new() -> Self {
        DelayedFlows {
            tree: BTreeSet::new(),
            next_due: u64::MAX,
            unthrottle_latency_ns: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Earliest pending release instant, for wakeup scheduling.
    pub fn next_due(&self) -> Option<u64> {
        if self.tree.is_empty() {
            None
        } else {
            Some(self.next_due)
        }
    }

    pub fn unthrottle_latency_ns(&self) -> u64 {
        self.unthrottle_latency_ns
    }

    /// Park a flow until `at`.
    pub fn insert(&mut self, at: u64, handle: FlowHandle) {
        self.tree.insert((at, handle));
        if self.next_due > at {
            self.next_due = at;
        }
    }

    /// Remove a specific entry (e.g. when a recycled identity clears its
    /// throttle early). The entry must have been inserted at `at`.
    pub fn remove(&mut self, at: u64, handle: FlowHandle) {
        self.tree.remove(&(at, handle));
    }

    /// Pop every flow due at or before `now`, updating the latency average
    /// and recomputing `next_due` from the first still-pending entry.
    pub fn drain_due(&mut self, now: u64) -> Vec<FlowHandle> {
        if self.next_due > now {
            return Vec::new();
        }

        let sample = now - self.next_due;
        self.unthrottle_latency_ns -= self.unthrottle_latency_ns >> 3;
        self.unthrottle_latency_ns += sample >> 3;

        self.next_due = u64::MAX;
        let mut due = Vec::new();
        while let Some(&(at, handle)) = self.tree.first() {
            if at > now {
                self.next_due = at;
                break;
            }
            self.tree.remove(&(at, handle));
            due.push(handle);
        }
        due
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.next_due = u64::MAX;
    }
}

impl Default for DelayedFlows {
    fn default() -> Self {
        Self::new()
    }
}
