//! # Scheduler Core
//!
//! Pure logic — no I/O, no locks, no timers. The host invokes `enqueue` and
//! `dequeue` from one logical caller, serializes control-path calls
//! (`resize`, `apply_config`) against them with its own exclusive lock, and
//! arms its own timer from [`FqScheduler::next_wakeup`] when `dequeue`
//! reports nothing ready.
//!
//! ## Service discipline
//!
//! Flows are served round-robin from two FIFO lists. A flow activates onto
//! the *new* list, and once its credit runs out it is demoted to the *old*
//! list, where it stays for as long as it keeps traffic queued. Serving
//! from the new list first gives short-lived flows low latency; demoting
//! exhausted flows to the old list keeps them from starving everyone else.
//! Pacing defers a flow's next release instant into the future, parking the
//! flow in the delayed index instead of either list.

use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, MonotonicClock, NSEC_PER_SEC};
use crate::config::{ConfigDelta, ConfigError, FqConfig, HorizonPolicy, MAX_SHARD_LOG};
use crate::delayed::DelayedFlows;
use crate::flow::{FlowKey, FlowRecord, Membership};
use crate::packet::{Packet, Priority};
use crate::stats::{SchedStats, StatsSnapshot};
use crate::table::{FlowHandle, FlowTable, Lookup};

// ─── DropReason ─────────────────────────────────────────────────────────────

/// Why an enqueue did not admit a packet. None of these are fatal; the
/// caller accounts a single drop and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("global packet limit reached")]
    QueueLimit,
    #[error("per-flow packet limit reached")]
    FlowLimit,
    #[error("deadline beyond the scheduling horizon")]
    Horizon,
}

// ─── Wakeup ─────────────────────────────────────────────────────────────────

/// A requested future invocation: call `dequeue` again no earlier than `at`
/// (ns), with `slack` of permissible lateness for timer coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub at: u64,
    pub slack: u64,
}

// ─── FqScheduler ────────────────────────────────────────────────────────────

/// Per-flow fair-queueing scheduler with rate pacing.
pub struct FqScheduler<C: Clock = MonotonicClock> {
    cfg: FqConfig,
    clock: C,
    /// Last clock reading, reused for horizon checks and GC age tests to
    /// keep clock reads off the common enqueue path.
    now_cache: u64,

    table: FlowTable,
    new_flows: VecDeque<FlowHandle>,
    old_flows: VecDeque<FlowHandle>,
    delayed: DelayedFlows,
    /// Serves control-priority, unclassifiable, and allocation-degraded
    /// packets ahead of every round-robin decision. Never in the table or
    /// on a list; credit does not apply to it.
    internal: FlowRecord,

    qlen: usize,
    backlog: u64,
    stats: SchedStats,
    wakeup: Option<Wakeup>,
}

impl FqScheduler<MonotonicClock> {
    pub fn new(cfg: FqConfig) -> Self {
        Self::with_clock(cfg, MonotonicClock::new())
    }
}

impl<C: Clock> FqScheduler<C> {
    pub fn with_clock(cfg: FqConfig, clock: C) -> Self {
        let now = clock.now_ns();
        FqScheduler {
            table: FlowTable::new(cfg.shard_log, cfg.max_flows),
            new_flows: VecDeque::new(),
            old_flows: VecDeque::new(),
            delayed: DelayedFlows::new(),
            internal: FlowRecord::new(FlowKey::Orphan(u64::MAX), 0, 0, now),
            qlen: 0,
            backlog: 0,
            stats: SchedStats::default(),
            wakeup: None,
            now_cache: now,
            cfg,
            clock,
        }
    }

    // ─── Enqueue ────────────────────────────────────────────────────────

    /// Admit one packet, classifying it into a flow and ordering it by
    /// effective send time.
    pub fn enqueue(&mut self, mut pkt: Packet) -> Result<(), DropReason> {
        if self.qlen >= self.cfg.plimit {
            self.stats.queue_limit_drops += 1;
            return Err(DropReason::QueueLimit);
        }

        pkt.time_to_send = self.effective_send_time(&pkt)?;

        let Some(handle) = self.classify(&pkt) else {
            self.enqueue_internal(pkt);
            return Ok(());
        };
        let Some(flow) = self.table.get_mut(handle) else {
            self.enqueue_internal(pkt);
            return Ok(());
        };

        if flow.qlen() >= self.cfg.flow_plimit {
            self.stats.flow_limit_drops += 1;
            return Err(DropReason::FlowLimit);
        }

        let len = pkt.len() as u64;
        let mut newly_active = false;
        if let Membership::Detached { since } = flow.membership {
            flow.membership = Membership::NewList;
            // A long-idle flow gets its credit topped back up, never cut.
            if self.now_cache > since.saturating_add(self.cfg.flow_refill_delay_ns) {
                flow.credit = flow.credit.max(self.cfg.quantum as i64);
            }
            newly_active = true;
        }
        flow.append(pkt);

        if newly_active {
            self.new_flows.push_back(handle);
            self.table.inactive -= 1;
        }
        self.qlen += 1;
        self.backlog += len;
        Ok(())
    }

    /// Resolve the packet's effective send time, applying horizon policy.
    fn effective_send_time(&mut self, pkt: &Packet) -> Result<u64, DropReason> {
        let Some(deadline) = pkt.deadline() else {
            self.now_cache = self.clock.now_ns();
            return Ok(self.now_cache);
        };

        // Test against the cached clock first; refresh once before
        // concluding the deadline really is beyond the horizon.
        if deadline > self.now_cache.saturating_add(self.cfg.horizon_ns) {
            self.now_cache = self.clock.now_ns();
            if deadline > self.now_cache.saturating_add(self.cfg.horizon_ns) {
                return match self.cfg.horizon_policy {
                    HorizonPolicy::Drop => {
                        self.stats.horizon_drops += 1;
                        Err(DropReason::Horizon)
                    }
                    HorizonPolicy::Cap => {
                        self.stats.horizon_caps += 1;
                        Ok(self.now_cache + self.cfg.horizon_ns)
                    }
                };
            }
        }
        Ok(deadline)
    }

    /// Map a packet to its flow. `None` routes it to the internal flow.
    fn classify(&mut self, pkt: &Packet) -> Option<FlowHandle> {
        if pkt.priority() == Priority::Control {
            return None;
        }

        let (key, generation) = match pkt.owner() {
            Some(owner) => (FlowKey::Conn(owner.id), owner.generation),
            None => (FlowKey::Orphan(pkt.hash() & self.cfg.orphan_mask), 0),
        };

        match self.table.lookup_or_create(
            key,
            generation,
            self.cfg.initial_quantum as i64,
            self.now_cache,
        ) {
            Lookup::Hit { handle, refreshed } => {
                if refreshed {
                    self.clear_throttle(handle);
                }
                Some(handle)
            }
            Lookup::Created(handle) => Some(handle),
            Lookup::Full => {
                self.stats.allocation_errors += 1;
                warn!("flow arena full; degrading packet to the internal flow");
                None
            }
        }
    }

    /// Recycled identity: forget the old pacing gate and return the flow to
    /// normal service if it was parked.
    fn clear_throttle(&mut self, handle: FlowHandle) {
        let Some(flow) = self.table.get_mut(handle) else {
            return;
        };
        if flow.membership == Membership::Throttled {
            self.delayed.remove(flow.time_next_packet, handle);
            flow.membership = Membership::OldList;
            self.old_flows.push_back(handle);
        }
        flow.time_next_packet = 0;
    }

    fn enqueue_internal(&mut self, pkt: Packet) {
        self.backlog += pkt.len() as u64;
        self.qlen += 1;
        self.stats.internal_packets += 1;
        self.internal.append(pkt);
    }

    // ─── Dequeue ────────────────────────────────────────────────────────

    /// Release at most one packet. Returns `None` when nothing is eligible
    /// right now; if throttled flows are pending, [`Self::next_wakeup`]
    /// then names the instant to try again.
    pub fn dequeue(&mut self) -> Option<Packet> {
        self.wakeup = None;
        if self.qlen == 0 {
            return None;
        }

        // Internal traffic bypasses round-robin, credit, and pacing.
        if let Some(pkt) = self.internal.take_head() {
            self.qlen -= 1;
            self.backlog -= pkt.len() as u64;
            return Some(pkt);
        }

        let now = self.clock.now_ns();
        self.now_cache = now;
        for handle in self.delayed.drain_due(now) {
            if let Some(flow) = self.table.get_mut(handle) {
                flow.membership = Membership::OldList;
            }
            self.old_flows.push_back(handle);
        }

        loop {
            let (handle, from_new) = if let Some(&h) = self.new_flows.front() {
                (h, true)
            } else if let Some(&h) = self.old_flows.front() {
                (h, false)
            } else {
                if let Some(at) = self.delayed.next_due() {
                    self.wakeup = Some(Wakeup {
                        at,
                        slack: self.cfg.timer_slack_ns,
                    });
                }
                return None;
            };

            let Some(flow) = self.table.get_mut(handle) else {
                self.pop_head(from_new);
                continue;
            };

            if flow.credit <= 0 {
                flow.credit += self.cfg.quantum as i64;
                flow.membership = Membership::OldList;
                self.pop_head(from_new);
                self.old_flows.push_back(handle);
                continue;
            }

            let head_tts = match flow.peek() {
                Some(head) => head.time_to_send(),
                None => {
                    // Drained flow. A new-list flow takes one pass through
                    // the old list before idling so late old flows are not
                    // starved of their turn.
                    if from_new && !self.old_flows.is_empty() {
                        flow.membership = Membership::OldList;
                        self.pop_head(true);
                        self.old_flows.push_back(handle);
                    } else {
                        flow.membership = Membership::Detached { since: now };
                        self.pop_head(from_new);
                        self.table.inactive += 1;
                    }
                    continue;
                }
            };

            let ttp = head_tts.max(flow.time_next_packet);
            if now < ttp {
                flow.time_next_packet = ttp;
                flow.membership = Membership::Throttled;
                self.pop_head(from_new);
                self.delayed.insert(ttp, handle);
                self.stats.throttled += 1;
                continue;
            }

            let Some(mut pkt) = flow.take_head() else {
                self.pop_head(from_new);
                continue;
            };
            if self.cfg.rate_enable && now - ttp > self.cfg.ce_threshold_ns {
                pkt.ce_marked = true;
                self.stats.ce_marks += 1;
            }

            let plen = pkt.len();
            flow.credit -= plen as i64;
            self.qlen -= 1;
            self.backlog -= plen as u64;

            if self.cfg.rate_enable {
                Self::update_pacing(&self.cfg, &mut self.stats, flow, &pkt, now);
            }
            return Some(pkt);
        }
    }

    fn pop_head(&mut self, from_new: bool) {
        if from_new {
            self.new_flows.pop_front();
        } else {
            self.old_flows.pop_front();
        }
    }

    /// Advance the flow's pacing gate after releasing `pkt`.
    fn update_pacing(
        cfg: &FqConfig,
        stats: &mut SchedStats,
        flow: &mut FlowRecord,
        pkt: &Packet,
        now: u64,
    ) {
        let mut rate = cfg.flow_max_rate;
        let mut plen = pkt.len() as u64;

        // An explicit deadline means the sender already paced this packet;
        // the flow gate only tightens further under a configured max rate.
        if pkt.deadline().is_none() {
            if let Some(cap) = pkt.owner().and_then(|o| o.rate_cap) {
                rate = Some(rate.map_or(cap, |r| r.min(cap)));
            }
            match rate {
                Some(r) if r <= cfg.low_rate_threshold => {
                    // Slow flows yield after every packet rather than
                    // bursting a whole quantum at once.
                    flow.credit = 0;
                }
                _ => {
                    plen = plen.max(cfg.quantum as u64);
                    if flow.credit > 0 {
                        return;
                    }
                }
            }
        }

        let Some(rate) = rate else {
            return;
        };

        let mut delay_ns = plen.saturating_mul(NSEC_PER_SEC);
        if rate > 0 {
            delay_ns /= rate;
        }
        // The owner's rate can change later; cap the gate at one second.
        if delay_ns > NSEC_PER_SEC {
            delay_ns = NSEC_PER_SEC;
            stats.pkts_too_long += 1;
        }
        // Account for scheduling drift: the prior gate was set when the
        // previous packet left, and `now` can already be late against it.
        if flow.time_next_packet > 0 {
            delay_ns -= (delay_ns / 2).min(now.saturating_sub(flow.time_next_packet));
        }
        flow.time_next_packet = now + delay_ns;
    }

    // ─── Control surface ────────────────────────────────────────────────

    /// Drop everything and return to the empty state. Idempotent; counters
    /// and configuration survive.
    pub fn reset(&mut self) {
        self.internal.purge();
        self.table.purge_all();
        self.new_flows.clear();
        self.old_flows.clear();
        self.delayed.clear();
        self.qlen = 0;
        self.backlog = 0;
        self.wakeup = None;
    }

    /// Re-shard the flow table to `1 << shard_log` shards. On error the
    /// table is untouched.
    pub fn resize(&mut self, shard_log: u8) -> Result<(), ConfigError> {
        if shard_log == 0 || shard_log > MAX_SHARD_LOG {
            return Err(ConfigError::InvalidShardLog(shard_log));
        }
        if shard_log != self.table.shard_log() {
            self.now_cache = self.clock.now_ns();
            self.table.rehash(shard_log, self.now_cache);
        }
        self.cfg.shard_log = shard_log;
        Ok(())
    }

    /// Apply a validated configuration delta atomically, resizing the table
    /// and force-draining down to a lowered packet limit as needed.
    pub fn apply_config(&mut self, delta: &ConfigDelta) -> Result<(), ConfigError> {
        delta.validate()?;
        delta.apply_to(&mut self.cfg);
        self.table.set_max_flows(self.cfg.max_flows);
        if let Some(log) = delta.shard_log {
            self.resize(log)?;
        }

        let mut drained = 0u64;
        while self.qlen > self.cfg.plimit {
            if self.dequeue().is_none() {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            self.stats.queue_limit_drops += drained;
            debug!(drained, "forced drain after capacity change");
        }
        Ok(())
    }

    // ─── Observability ──────────────────────────────────────────────────

    /// Packets currently queued.
    pub fn len(&self) -> usize {
        self.qlen
    }

    pub fn is_empty(&self) -> bool {
        self.qlen == 0
    }

    /// Bytes currently queued.
    pub fn backlog_bytes(&self) -> u64 {
        self.backlog
    }

    pub fn config(&self) -> &FqConfig {
        &self.cfg
    }

    /// The wakeup chosen by the last `dequeue` that found nothing ready,
    /// if throttled flows are pending.
    pub fn next_wakeup(&self) -> Option<Wakeup> {
        self.wakeup
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flows: self.table.flows(),
            inactive_flows: self.table.inactive_flows(),
            throttled_flows: self.delayed.len(),
            qlen: self.qlen,
            backlog_bytes: self.backlog,
            unthrottle_latency_ns: self.delayed.unthrottle_latency_ns(),
            gc_flows: self.table.gc_flows,
            counters: self.stats.clone(),
        }
    }
}
