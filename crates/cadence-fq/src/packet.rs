//! # Packet
//!
//! The unit handed across the host boundary. The scheduler never looks
//! inside the payload; it reads the byte length, the priority class, the
//! owning-flow identity, and the optional earliest-departure deadline, and
//! it writes back the effective send time and the congestion-experienced
//! mark.

use bytes::Bytes;

// ─── Priority ────────────────────────────────────────────────────────────────

/// Scheduling class of a packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Normal traffic — fair-shared per flow.
    #[default]
    Standard = 0,
    /// Control traffic — served from the internal flow ahead of every
    /// round-robin decision. No starvation prevention applies.
    Control = 1,
}

// ─── FlowOwner ──────────────────────────────────────────────────────────────

/// Identity of the connection a packet belongs to.
///
/// `id` is a stable surrogate key supplied by the host (a connection
/// sequence number or similar) — never a reused memory address. The
/// `generation` changes when the host recycles the identity for a new
/// connection, so the scheduler can detect reuse and reset flow credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOwner {
    pub id: u64,
    pub generation: u64,
    /// Pacing rate cap for this owner in bytes/sec, if the host enforces one.
    pub rate_cap: Option<u64>,
}

impl FlowOwner {
    pub fn new(id: u64, generation: u64) -> Self {
        FlowOwner {
            id,
            generation,
            rate_cap: None,
        }
    }

    pub fn with_rate_cap(mut self, bytes_per_sec: u64) -> Self {
        self.rate_cap = Some(bytes_per_sec);
        self
    }
}

// ─── Packet ─────────────────────────────────────────────────────────────────

/// A packet queued for transmission.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Bytes,
    priority: Priority,
    owner: Option<FlowOwner>,
    /// Host-computed flow hash, used to synthesize a pseudo-identity for
    /// packets without an owner so they still fair-share across buckets.
    hash: u64,
    /// Explicit earliest-departure deadline (ns), if the sender set one.
    deadline: Option<u64>,
    /// Effective send time assigned at enqueue (deadline, clamped deadline,
    /// or the enqueue instant).
    pub(crate) time_to_send: u64,
    /// Congestion-experienced mark, set when the packet was released later
    /// than its scheduled instant by more than the configured threshold.
    pub(crate) ce_marked: bool,
}

impl Packet {
    pub fn new(payload: Bytes) -> Self {
        Packet {
            payload,
            priority: Priority::Standard,
            owner: None,
            hash: 0,
            deadline: None,
            time_to_send: 0,
            ce_marked: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: FlowOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_hash(mut self, hash: u64) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_deadline(mut self, deadline_ns: u64) -> Self {
        self.deadline = Some(deadline_ns);
        self
    }

    /// Byte length charged against flow credit.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn owner(&self) -> Option<FlowOwner> {
        self.owner
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Effective send time (ns) the scheduler released or will release this
    /// packet at. Meaningful once the packet has been enqueued.
    pub fn time_to_send(&self) -> u64 {
        self.time_to_send
    }

    /// Whether the scheduler marked this packet congestion-experienced.
    pub fn ce_marked(&self) -> bool {
        self.ce_marked
    }
}
