//! # Flow Records
//!
//! One record per distinct flow: its identity, the deadline-ordered packet
//! queue, the round-robin credit, and the pacing gate.
//!
//! Packets usually arrive with monotonically increasing send times, so the
//! common case is an O(1) FIFO append. A packet whose send time precedes
//! the current tail goes into a deadline-ordered side tree instead; `peek`
//! and `take_head` merge the two so the flow always releases in
//! non-decreasing send-time order.

use std::collections::{BTreeMap, VecDeque};

use crate::packet::Packet;

// ─── FlowKey ────────────────────────────────────────────────────────────────

/// Flow identity — an opaque, totally-ordered key.
///
/// Only ordering and equality are ever used; the scheduler never
/// dereferences an identity. Orphan keys are synthesized from a packet hash
/// and can never collide with host-supplied connection keys because the
/// variants are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlowKey {
    /// Stable surrogate identity supplied by the host for owned traffic.
    Conn(u64),
    /// Masked packet hash standing in for unowned traffic.
    Orphan(u64),
}

// ─── Membership ─────────────────────────────────────────────────────────────

/// Where a flow currently lives. A flow is in exactly one place at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// On the new-flows round-robin list.
    NewList,
    /// On the old-flows round-robin list.
    OldList,
    /// Parked in the delayed index until `time_next_packet`.
    Throttled,
    /// Queue is empty; `since` (ns) drives garbage collection. The record
    /// is kept around because the flow is likely to send again soon.
    Detached { since: u64 },
}

// ─── FlowRecord ─────────────────────────────────────────────────────────────

/// Per-flow scheduling state.
pub struct FlowRecord {
    pub key: FlowKey,
    /// Disambiguates identity reuse: when the host hands us a packet whose
    /// owner generation differs from this, the connection was recycled and
    /// credit is re-initialized.
    pub generation: u64,
    /// Byte budget for the current round-robin pass. Goes negative; a
    /// non-positive value ends the flow's turn.
    pub credit: i64,
    /// Earliest instant (ns) the flow may emit its next packet. Zero means
    /// unpaced.
    pub time_next_packet: u64,
    pub membership: Membership,

    /// In-order packets (non-decreasing send time).
    fifo: VecDeque<Packet>,
    /// Packets that arrived with a send time before the FIFO tail, keyed by
    /// `(time_to_send, arrival_seq)` so equal deadlines drain in arrival
    /// order.
    ooo: BTreeMap<(u64, u64), Packet>,
    ooo_seq: u64,
}

impl FlowRecord {
    pub fn new(key: FlowKey, generation: u64, credit: i64, now: u64) -> Self {
        FlowRecord {
            key,
            generation,
            credit,
            time_next_packet: 0,
            membership: Membership::Detached { since: now },
            fifo: VecDeque::new(),
            ooo: BTreeMap::new(),
            ooo_seq: 0,
        }
    }

    /// Number of packets queued on this flow.
    pub fn qlen(&self) -> usize {
        self.fifo.len() + self.ooo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty() && self.ooo.is_empty()
    }

    /// Queue a packet. O(1) when its send time is not before the current
    /// tail's, otherwise an ordered insert into the side tree.
    pub fn append(&mut self, pkt: Packet) {
        match self.fifo.back() {
            Some(tail) if pkt.time_to_send < tail.time_to_send => {
                self.ooo_seq += 1;
                self.ooo.insert((pkt.time_to_send, self.ooo_seq), pkt);
            }
            _ => self.fifo.push_back(pkt),
        }
    }

    /// The packet with the smallest send time across both structures.
    /// Ties favor the FIFO.
    pub fn peek(&self) -> Option<&Packet> {
        match (self.ooo.first_key_value(), self.fifo.front()) {
            (Some((_, tree)), Some(head)) => {
                if tree.time_to_send < head.time_to_send {
                    Some(tree)
                } else {
                    Some(head)
                }
            }
            (Some((_, tree)), None) => Some(tree),
            (None, head) => head,
        }
    }

    /// Remove and return the packet `peek` would have returned.
    pub fn take_head(&mut self) -> Option<Packet> {
        let from_tree = match (self.ooo.first_key_value(), self.fifo.front()) {
            (Some((_, tree)), Some(head)) => tree.time_to_send < head.time_to_send,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if from_tree {
            self.ooo.pop_first().map(|(_, pkt)| pkt)
        } else {
            self.fifo.pop_front()
        }
    }

    /// Drop every queued packet, returning `(packets, bytes)` removed.
    pub fn purge(&mut self) -> (usize, u64) {
        let count = self.qlen();
        let bytes = self
            .fifo
            .iter()
            .chain(self.ooo.values())
            .map(|p| p.len() as u64)
            .sum();
        self.fifo.clear();
        self.ooo.clear();
        (count, bytes)
    }
}
