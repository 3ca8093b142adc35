//! # Flow Table
//!
//! A sharded index of flow records keyed by [`FlowKey`]. Records live in a
//! bounded slab arena and are addressed by [`FlowHandle`]; each shard keeps
//! an ordered map from key to handle for O(log n) lookup.
//!
//! Empty flows are not removed eagerly — a flow that just drained is likely
//! to send again, so its record stays detached in the table until a bounded
//! garbage-collection pass reclaims it after a minimum idle age.

use slab::Slab;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::clock::NSEC_PER_SEC;
use crate::flow::{FlowKey, FlowRecord, Membership};

/// Most records reclaimed by a single GC pass.
pub const GC_MAX_PER_PASS: usize = 8;
/// A detached flow must be idle at least this long before GC may take it.
pub const GC_MIN_IDLE_NS: u64 = 3 * NSEC_PER_SEC;

// ─── FlowHandle ─────────────────────────────────────────────────────────────

/// Stable handle to a flow record in the arena.
///
/// Handles stay valid while the record exists; GC only reclaims detached
/// flows, which by the membership invariant sit on no list, so no live
/// handle is ever left dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowHandle(pub(crate) usize);

// ─── Lookup outcome ─────────────────────────────────────────────────────────

/// Result of [`FlowTable::lookup_or_create`].
pub enum Lookup {
    /// Existing record. `refreshed` is set when the owner generation
    /// changed (connection identity was recycled): credit has been
    /// re-initialized and the caller must clear any throttle state.
    Hit { handle: FlowHandle, refreshed: bool },
    /// Fresh record, detached, with initial credit.
    Created(FlowHandle),
    /// Arena at capacity — caller degrades the packet to the internal flow.
    Full,
}

// ─── FlowTable ──────────────────────────────────────────────────────────────

pub struct FlowTable {
    arena: Slab<FlowRecord>,
    shards: Vec<BTreeMap<FlowKey, FlowHandle>>,
    shard_log: u8,
    max_flows: usize,
    /// Detached (empty) records currently held in the table.
    pub(crate) inactive: usize,
    /// Records reclaimed by GC and rehash, cumulative.
    pub(crate) gc_flows: u64,
}

impl FlowTable {
    pub fn new(shard_log: u8, max_flows: usize) -> Self {
        FlowTable {
            arena: Slab::new(),
            shards: vec![BTreeMap::new(); 1usize << shard_log],
            shard_log,
            max_flows,
            inactive: 0,
            gc_flows: 0,
        }
    }

    pub fn shard_log(&self) -> u8 {
        self.shard_log
    }

    /// Total records, detached included.
    pub fn flows(&self) -> usize {
        self.arena.len()
    }

    pub fn inactive_flows(&self) -> usize {
        self.inactive
    }

    pub(crate) fn set_max_flows(&mut self, max_flows: usize) {
        self.max_flows = max_flows;
    }

    pub fn get(&self, handle: FlowHandle) -> Option<&FlowRecord> {
        self.arena.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: FlowHandle) -> Option<&mut FlowRecord> {
        self.arena.get_mut(handle.0)
    }

    /// Find the record for `key`, creating it if absent.
    ///
    /// Runs a bounded GC pass against the target shard first when the table
    /// is crowded and mostly idle, amortizing reclamation across lookups.
    pub fn lookup_or_create(
        &mut self,
        key: FlowKey,
        generation: u64,
        initial_credit: i64,
        now: u64,
    ) -> Lookup {
        let idx = self.shard_index(key);

        if self.arena.len() >= (2usize << self.shard_log)
            && self.inactive > self.arena.len() / 2
        {
            self.gc_shard(idx, key, now);
        }

        if let Some(&handle) = self.shards[idx].get(&key) {
            let mut refreshed = false;
            if let Some(flow) = self.arena.get_mut(handle.0) {
                if matches!(key, FlowKey::Conn(_)) && flow.generation != generation {
                    flow.credit = initial_credit;
                    flow.generation = generation;
                    refreshed = true;
                }
            }
            return Lookup::Hit { handle, refreshed };
        }

        if self.arena.len() >= self.max_flows {
            return Lookup::Full;
        }

        let record = FlowRecord::new(key, generation, initial_credit, now);
        let handle = FlowHandle(self.arena.insert(record));
        self.shards[idx].insert(key, handle);
        self.inactive += 1;
        Lookup::Created(handle)
    }

    /// Reclaim up to [`GC_MAX_PER_PASS`] long-idle records from one shard.
    /// The looked-up key itself is never collected.
    fn gc_shard(&mut self, idx: usize, skip: FlowKey, now: u64) {
        let mut victims: Vec<(FlowKey, FlowHandle)> = Vec::new();
        for (&key, &handle) in &self.shards[idx] {
            if key == skip {
                continue;
            }
            if let Some(flow) = self.arena.get(handle.0) {
                if gc_candidate(flow, now) {
                    victims.push((key, handle));
                    if victims.len() == GC_MAX_PER_PASS {
                        break;
                    }
                }
            }
        }
        if victims.is_empty() {
            return;
        }
        for &(key, handle) in &victims {
            self.shards[idx].remove(&key);
            self.arena.remove(handle.0);
        }
        self.inactive -= victims.len();
        self.gc_flows += victims.len() as u64;
        debug!(shard = idx, reclaimed = victims.len(), "flow gc pass");
    }

    /// Re-shard every record into a table of `1 << new_log` shards,
    /// discarding GC-eligible records met along the walk.
    pub fn rehash(&mut self, new_log: u8, now: u64) {
        let old = std::mem::take(&mut self.shards);
        let old_log = self.shard_log;
        self.shard_log = new_log;
        self.shards = vec![BTreeMap::new(); 1usize << new_log];

        let mut reclaimed = 0usize;
        for shard in old {
            for (key, handle) in shard {
                let keep = match self.arena.get(handle.0) {
                    Some(flow) => !gc_candidate(flow, now),
                    None => false,
                };
                if !keep {
                    if self.arena.contains(handle.0) {
                        self.arena.remove(handle.0);
                        reclaimed += 1;
                    }
                    continue;
                }
                let idx = self.shard_index(key);
                self.shards[idx].insert(key, handle);
            }
        }
        self.inactive -= reclaimed;
        self.gc_flows += reclaimed as u64;
        debug!(old_log, new_log, reclaimed, "flow table rehash");
    }

    /// Drop every record. Queued packets go with them; the caller resets
    /// its own backlog accounting.
    pub fn purge_all(&mut self) {
        for shard in &mut self.shards {
            shard.clear();
        }
        self.arena.clear();
        self.inactive = 0;
    }

    fn shard_index(&self, key: FlowKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & ((1usize << self.shard_log) - 1)
    }
}

fn gc_candidate(flow: &FlowRecord, now: u64) -> bool {
    match flow.membership {
        Membership::Detached { since } => now > since.saturating_add(GC_MIN_IDLE_NS),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL: i64 = 15_000;

    fn table() -> FlowTable {
        FlowTable::new(2, 1024)
    }

    fn create(t: &mut FlowTable, id: u64, now: u64) -> FlowHandle {
        match t.lookup_or_create(FlowKey::Conn(id), 1, INITIAL, now) {
            Lookup::Created(h) => h,
            _ => panic!("expected fresh record for id {id}"),
        }
    }

    #[test]
    fn create_then_hit() {
        let mut t = table();
        let h = create(&mut t, 1, 0);
        assert_eq!(t.flows(), 1);
        assert_eq!(t.inactive_flows(), 1);
        assert_eq!(t.get(h).unwrap().credit, INITIAL);

        match t.lookup_or_create(FlowKey::Conn(1), 1, INITIAL, 0) {
            Lookup::Hit { handle, refreshed } => {
                assert_eq!(handle, h);
                assert!(!refreshed, "same generation must not refresh");
            }
            _ => panic!("expected hit"),
        }
        assert_eq!(t.flows(), 1);
    }

    #[test]
    fn generation_change_refreshes_credit() {
        let mut t = table();
        let h = create(&mut t, 1, 0);
        t.get_mut(h).unwrap().credit = -500;

        match t.lookup_or_create(FlowKey::Conn(1), 2, INITIAL, 0) {
            Lookup::Hit { refreshed, .. } => assert!(refreshed),
            _ => panic!("expected hit"),
        }
        let flow = t.get(h).unwrap();
        assert_eq!(flow.credit, INITIAL);
        assert_eq!(flow.generation, 2);
    }

    #[test]
    fn orphan_keys_never_refresh() {
        let mut t = table();
        let h = match t.lookup_or_create(FlowKey::Orphan(9), 0, INITIAL, 0) {
            Lookup::Created(h) => h,
            _ => panic!("expected fresh record"),
        };
        t.get_mut(h).unwrap().credit = -1;
        match t.lookup_or_create(FlowKey::Orphan(9), 7, INITIAL, 0) {
            Lookup::Hit { refreshed, .. } => assert!(!refreshed),
            _ => panic!("expected hit"),
        }
        assert_eq!(t.get(h).unwrap().credit, -1);
    }

    #[test]
    fn arena_capacity_degrades_to_full() {
        let mut t = FlowTable::new(1, 2);
        create(&mut t, 1, 0);
        create(&mut t, 2, 0);
        assert!(matches!(
            t.lookup_or_create(FlowKey::Conn(3), 1, INITIAL, 0),
            Lookup::Full
        ));
        // Existing flows are still reachable.
        assert!(matches!(
            t.lookup_or_create(FlowKey::Conn(1), 1, INITIAL, 0),
            Lookup::Hit { .. }
        ));
    }

    #[test]
    fn gc_reclaims_only_aged_idle_flows() {
        // Single shard so the pass deterministically sees every record.
        let mut t = FlowTable::new(0, 1024);
        for id in 1..=4 {
            create(&mut t, id, 0);
        }
        // Fifth lookup, long after the idle age: the crowded-and-idle
        // trigger fires against the target shard.
        let now = GC_MIN_IDLE_NS + 1;
        t.lookup_or_create(FlowKey::Conn(5), 1, INITIAL, now);
        assert_eq!(t.flows(), 1, "only the fresh flow survives");
        assert_eq!(t.gc_flows, 4);
    }

    #[test]
    fn gc_spares_young_idle_flows() {
        let mut t = FlowTable::new(0, 1024);
        for id in 1..=4 {
            create(&mut t, id, 0);
        }
        // Idle, but not yet past the age threshold.
        t.lookup_or_create(FlowKey::Conn(5), 1, INITIAL, GC_MIN_IDLE_NS / 2);
        assert_eq!(t.flows(), 5);
        assert_eq!(t.gc_flows, 0);
    }

    #[test]
    fn reclaimed_identity_gets_fresh_record() {
        let mut t = FlowTable::new(0, 1024);
        let h = create(&mut t, 1, 0);
        t.get_mut(h).unwrap().credit = -42;
        for id in 2..=4 {
            create(&mut t, id, 0);
        }
        let now = GC_MIN_IDLE_NS + 1;
        // An unrelated lookup runs the pass that collects key 1.
        t.lookup_or_create(FlowKey::Conn(50), 1, INITIAL, now);

        // Key 1 is gone; looking it up again must build a brand-new record
        // with default credit, not resurrect stale state.
        match t.lookup_or_create(FlowKey::Conn(1), 1, INITIAL, now) {
            Lookup::Created(h2) => assert_eq!(t.get(h2).unwrap().credit, INITIAL),
            Lookup::Hit { .. } => panic!("stale record survived gc"),
            Lookup::Full => panic!("table unexpectedly full"),
        }
    }

    #[test]
    fn rehash_keeps_live_flows_and_drops_aged() {
        let mut t = FlowTable::new(1, 1024);
        for id in 1..=6 {
            create(&mut t, id, 0);
        }
        // Mark three as recently active so they survive.
        for id in 1..=3u64 {
            if let Lookup::Hit { handle, .. } =
                t.lookup_or_create(FlowKey::Conn(id), 1, INITIAL, 0)
            {
                t.get_mut(handle).unwrap().membership = Membership::OldList;
            }
        }
        t.rehash(4, GC_MIN_IDLE_NS + 1);
        assert_eq!(t.shard_log(), 4);
        assert_eq!(t.flows(), 3, "aged detached flows dropped during rehash");
        for id in 1..=3 {
            assert!(matches!(
                t.lookup_or_create(FlowKey::Conn(id), 1, INITIAL, 0),
                Lookup::Hit { .. }
            ));
        }
    }
}
