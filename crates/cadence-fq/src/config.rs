//! # Configuration
//!
//! Scheduler tunables, their defaults, and the delta type used for runtime
//! reconfiguration. A delta is validated as a whole before any field is
//! committed — an invalid delta changes nothing.

use thiserror::Error;

use crate::clock::{NSEC_PER_MSEC, NSEC_PER_SEC, NSEC_PER_USEC};

/// Reference MTU used to size the default quanta.
pub const DEFAULT_MTU: u32 = 1_500;
/// Largest accepted quantum (1 MiB).
pub const MAX_QUANTUM: u32 = 1 << 20;
/// Largest accepted shard-count exponent (256Ki shards).
pub const MAX_SHARD_LOG: u8 = 18;

// ─── Horizon policy ─────────────────────────────────────────────────────────

/// What to do with a packet whose deadline lies beyond the horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonPolicy {
    /// Drop the packet (counted).
    Drop,
    /// Clamp its deadline to `now + horizon` (counted separately).
    Cap,
}

// ─── FqConfig ───────────────────────────────────────────────────────────────

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct FqConfig {
    /// Total packets admitted across all flows.
    pub plimit: usize,
    /// Packets admitted per flow (the internal flow is exempt).
    pub flow_plimit: usize,
    /// Service credit granted per round-robin pass (bytes).
    pub quantum: u32,
    /// Credit granted to a brand-new flow (bytes).
    pub initial_quantum: u32,
    /// A flow idle longer than this gets its credit topped back up to one
    /// quantum on re-activation.
    pub flow_refill_delay_ns: u64,
    /// Master switch for rate pacing.
    pub rate_enable: bool,
    /// Pacing ceiling for every flow (bytes/sec); `None` = unlimited.
    pub flow_max_rate: Option<u64>,
    /// At or below this rate (bytes/sec) a flow's credit is zeroed after
    /// every packet, so slow flows yield their turn immediately.
    pub low_rate_threshold: u64,
    /// Mark a packet congestion-experienced when it leaves this much later
    /// (ns) than its scheduled instant. `u64::MAX` disables marking.
    pub ce_threshold_ns: u64,
    /// Furthest a deadline may lie in the future (ns).
    pub horizon_ns: u64,
    pub horizon_policy: HorizonPolicy,
    /// Shard-count exponent for the flow table (`1 << shard_log` shards).
    pub shard_log: u8,
    /// Mask applied to the packet hash when synthesizing orphan identities.
    pub orphan_mask: u64,
    /// Slack passed along with requested wakeups (ns).
    pub timer_slack_ns: u64,
    /// Flow-record arena capacity; lookups past it degrade to the internal
    /// flow instead of failing the enqueue.
    pub max_flows: usize,
}

impl Default for FqConfig {
    fn default() -> Self {
        FqConfig {
            plimit: 10_000,
            flow_plimit: 100,
            quantum: 2 * DEFAULT_MTU,
            initial_quantum: 10 * DEFAULT_MTU,
            flow_refill_delay_ns: 40 * NSEC_PER_MSEC,
            rate_enable: true,
            flow_max_rate: None,
            low_rate_threshold: 550_000 / 8,
            ce_threshold_ns: u64::MAX,
            horizon_ns: 10 * NSEC_PER_SEC,
            horizon_policy: HorizonPolicy::Drop,
            shard_log: 10,
            orphan_mask: 1_024 - 1,
            timer_slack_ns: 10 * NSEC_PER_USEC,
            max_flows: 256 * 1_024,
        }
    }
}

// ─── ConfigError ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("quantum must be within 1..=1048576 bytes, got {0}")]
    InvalidQuantum(u32),
    #[error("shard exponent must be within 1..=18, got {0}")]
    InvalidShardLog(u8),
    #[error("max_flows must be nonzero")]
    InvalidMaxFlows,
}

// ─── ConfigDelta ────────────────────────────────────────────────────────────

/// A partial configuration update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigDelta {
    pub plimit: Option<usize>,
    pub flow_plimit: Option<usize>,
    pub quantum: Option<u32>,
    pub initial_quantum: Option<u32>,
    pub flow_refill_delay_ns: Option<u64>,
    pub rate_enable: Option<bool>,
    /// `Some(None)` clears the cap back to unlimited.
    pub flow_max_rate: Option<Option<u64>>,
    pub low_rate_threshold: Option<u64>,
    pub ce_threshold_ns: Option<u64>,
    pub horizon_ns: Option<u64>,
    pub horizon_policy: Option<HorizonPolicy>,
    pub shard_log: Option<u8>,
    pub orphan_mask: Option<u64>,
    pub timer_slack_ns: Option<u64>,
    pub max_flows: Option<usize>,
}

impl ConfigDelta {
    /// Check every present field. Nothing is applied here; an error means
    /// the whole delta is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(q) = self.quantum {
            if q == 0 || q > MAX_QUANTUM {
                return Err(ConfigError::InvalidQuantum(q));
            }
        }
        if let Some(log) = self.shard_log {
            if log == 0 || log > MAX_SHARD_LOG {
                return Err(ConfigError::InvalidShardLog(log));
            }
        }
        if self.max_flows == Some(0) {
            return Err(ConfigError::InvalidMaxFlows);
        }
        Ok(())
    }

    /// Commit every present field. Call only after [`validate`](Self::validate).
    pub(crate) fn apply_to(&self, cfg: &mut FqConfig) {
        if let Some(v) = self.plimit {
            cfg.plimit = v;
        }
        if let Some(v) = self.flow_plimit {
            cfg.flow_plimit = v;
        }
        if let Some(v) = self.quantum {
            cfg.quantum = v;
        }
        if let Some(v) = self.initial_quantum {
            cfg.initial_quantum = v;
        }
        if let Some(v) = self.flow_refill_delay_ns {
            cfg.flow_refill_delay_ns = v;
        }
        if let Some(v) = self.rate_enable {
            cfg.rate_enable = v;
        }
        if let Some(v) = self.flow_max_rate {
            cfg.flow_max_rate = v;
        }
        if let Some(v) = self.low_rate_threshold {
            cfg.low_rate_threshold = v;
        }
        if let Some(v) = self.ce_threshold_ns {
            cfg.ce_threshold_ns = v;
        }
        if let Some(v) = self.horizon_ns {
            cfg.horizon_ns = v;
        }
        if let Some(v) = self.horizon_policy {
            cfg.horizon_policy = v;
        }
        if let Some(v) = self.shard_log {
            cfg.shard_log = v;
        }
        if let Some(v) = self.orphan_mask {
            cfg.orphan_mask = v;
        }
        if let Some(v) = self.timer_slack_ns {
            cfg.timer_slack_ns = v;
        }
        if let Some(v) = self.max_flows {
            cfg.max_flows = v;
        }
    }
}
