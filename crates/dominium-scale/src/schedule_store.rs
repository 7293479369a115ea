// SPDX-License-Identifier: Apache-2.0
//! Macro schedule store: per-domain macro timer state, sorted by domain id.

use bytes::Bytes;

use crate::capsule_store::StoreError;
use crate::domain::Tick;
use crate::wire::{check_version, Reader, Writer};

/// Container format version.
pub const SCHEDULE_STORE_VERSION: u32 = 1;

/// Fixed serialized size of one schedule entry.
const ENTRY_SIZE: usize = 68;

/// Macro timer state for one latent domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Domain the schedule belongs to.
    pub domain_id: u64,
    /// Capsule the macro events mutate.
    pub capsule_id: u64,
    /// Tick of the last executed macro event.
    pub last_event_time: Tick,
    /// Tick of the next scheduled macro event.
    pub next_event_time: Tick,
    /// Interval between macro events.
    pub interval_ticks: Tick,
    /// Seed for macro event ordering keys.
    pub order_key_seed: u64,
    /// Macro events executed so far.
    pub executed_events: u32,
    /// Narrative-flagged events executed so far.
    pub narrative_events: u32,
    /// History is summarized up to this tick.
    pub compacted_through_time: Tick,
    /// Number of compactions performed.
    pub compaction_count: u32,
}

/// Sorted per-domain schedule store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroScheduleStore {
    entries: Vec<ScheduleEntry>,
}

impl MacroScheduleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, domain_id: u64) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.domain_id.cmp(&domain_id))
    }

    /// Inserts or replaces the schedule for `entry.domain_id`.
    pub fn set(&mut self, entry: ScheduleEntry) -> Result<(), StoreError> {
        if entry.domain_id == 0 {
            return Err(StoreError::ZeroId);
        }
        match self.index_of(entry.domain_id) {
            Ok(idx) => self.entries[idx] = entry,
            Err(idx) => self.entries.insert(idx, entry),
        }
        Ok(())
    }

    /// Copies out the schedule for `domain_id`.
    #[must_use]
    pub fn get(&self, domain_id: u64) -> Option<ScheduleEntry> {
        self.index_of(domain_id).ok().map(|idx| self.entries[idx])
    }

    /// Removes the schedule for `domain_id`, if present.
    pub fn remove(&mut self, domain_id: u64) {
        if let Ok(idx) = self.index_of(domain_id) {
            self.entries.remove(idx);
        }
    }

    /// Copies out the entry at sorted position `index`.
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<ScheduleEntry> {
        self.entries.get(index).copied()
    }

    /// Number of schedules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no schedules exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every schedule.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serializes the store: `u32 version, u32 count, [68-byte entry]*`.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut w = Writer::with_capacity(8 + self.entries.len() * ENTRY_SIZE);
        w.put_u32(SCHEDULE_STORE_VERSION);
        w.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            w.put_u64(e.domain_id);
            w.put_u64(e.capsule_id);
            w.put_i64(e.last_event_time);
            w.put_i64(e.next_event_time);
            w.put_i64(e.interval_ticks);
            w.put_u64(e.order_key_seed);
            w.put_u32(e.executed_events);
            w.put_u32(e.narrative_events);
            w.put_i64(e.compacted_through_time);
            w.put_u32(e.compaction_count);
        }
        w.finish()
    }

    /// Rebuilds a store from serialized bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(bytes);
        check_version(&mut r, SCHEDULE_STORE_VERSION)?;
        let count = r.get_u32()?;
        let mut store = Self::new();
        for _ in 0..count {
            let entry = ScheduleEntry {
                domain_id: r.get_u64()?,
                capsule_id: r.get_u64()?,
                last_event_time: r.get_i64()?,
                next_event_time: r.get_i64()?,
                interval_ticks: r.get_i64()?,
                order_key_seed: r.get_u64()?,
                executed_events: r.get_u32()?,
                narrative_events: r.get_u32()?,
                compacted_through_time: r.get_i64()?,
                compaction_count: r.get_u32()?,
            };
            store.set(entry)?;
        }
        r.expect_end()?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domain: u64) -> ScheduleEntry {
        ScheduleEntry {
            domain_id: domain,
            capsule_id: domain * 100,
            last_event_time: 4,
            next_event_time: 20,
            interval_ticks: 16,
            order_key_seed: 0xabcd,
            executed_events: 2,
            narrative_events: 1,
            compacted_through_time: 4,
            compaction_count: 0,
        }
    }

    #[test]
    fn entries_sorted_by_domain() {
        let mut store = MacroScheduleStore::new();
        store.set(entry(5)).expect("set");
        store.set(entry(1)).expect("set");
        store.set(entry(3)).expect("set");
        let ids: Vec<u64> = (0..store.len())
            .map(|i| store.get_by_index(i).expect("index").domain_id)
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn entry_wire_size_is_fixed() {
        let mut store = MacroScheduleStore::new();
        store.set(entry(1)).expect("set");
        store.set(entry(2)).expect("set");
        assert_eq!(store.serialize().len(), 8 + 2 * 68);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut store = MacroScheduleStore::new();
        store.set(entry(7)).expect("set");
        store
            .set(ScheduleEntry {
                last_event_time: -3,
                ..entry(2)
            })
            .expect("set");
        let back = MacroScheduleStore::deserialize(&store.serialize()).expect("deserialize");
        assert_eq!(store, back);
    }

    #[test]
    fn remove_is_exact() {
        let mut store = MacroScheduleStore::new();
        store.set(entry(1)).expect("set");
        store.set(entry(2)).expect("set");
        store.remove(1);
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_some());
    }

    #[test]
    fn zero_domain_rejected() {
        let mut store = MacroScheduleStore::new();
        assert_eq!(store.set(entry(0)), Err(StoreError::ZeroId));
    }
}
