//! # Scheduler Statistics
//!
//! Monotonic event counters plus a gauge-carrying snapshot. Everything
//! serializes for export; the scheduler itself never publishes anything.

use serde::Serialize;

// ─── Counters ───────────────────────────────────────────────────────────────

/// Cumulative event counters. Only ever incremented; `reset()` on the
/// scheduler empties the queues but keeps history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedStats {
    /// Packets served through the internal (high-priority) flow.
    pub internal_packets: u64,
    /// Times a flow was parked in the delayed index.
    pub throttled: u64,
    /// Packets marked congestion-experienced.
    pub ce_marks: u64,
    /// Packets dropped for a deadline beyond the horizon.
    pub horizon_drops: u64,
    /// Packets whose deadline was clamped to the horizon.
    pub horizon_caps: u64,
    /// Packets dropped at the global admission limit (including forced
    /// drains after the limit was lowered).
    pub queue_limit_drops: u64,
    /// Packets dropped at the per-flow limit.
    pub flow_limit_drops: u64,
    /// Pacing delays clamped to the one-second ceiling.
    pub pkts_too_long: u64,
    /// Flow allocations that failed and degraded to the internal flow.
    pub allocation_errors: u64,
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Point-in-time view: counters plus live gauges.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Flow records in the table, detached included.
    pub flows: usize,
    /// Detached (empty) flow records.
    pub inactive_flows: usize,
    /// Flows parked in the delayed index.
    pub throttled_flows: usize,
    /// Packets queued across all flows.
    pub qlen: usize,
    /// Bytes queued across all flows.
    pub backlog_bytes: u64,
    /// Smoothed lateness of throttled-flow release (ns).
    pub unthrottle_latency_ns: u64,
    /// Flow records reclaimed by GC and rehash, cumulative.
    pub gc_flows: u64,
    pub counters: SchedStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_to_json() {
        let snap = StatsSnapshot {
            flows: 3,
            inactive_flows: 1,
            throttled_flows: 1,
            qlen: 42,
            backlog_bytes: 63_000,
            unthrottle_latency_ns: 1_200,
            gc_flows: 2,
            counters: SchedStats {
                throttled: 7,
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"flows\":3"));
        assert!(json.contains("\"throttled\":7"));
        assert!(json.contains("\"backlog_bytes\":63000"));
    }
}
