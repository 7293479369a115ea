// SPDX-License-Identifier: Apache-2.0
//! Deterministically ordered macro event queue.
//!
//! The queue is a sorted sequence, not a binary heap: the full ordering
//! key `(event_time, order_key, domain_id, event_id, sequence)` makes the
//! pop order a total order, so two implementations draining the same
//! queue observe identical sequences.

use bytes::Bytes;

use crate::capsule_store::StoreError;
use crate::domain::Tick;
use crate::wire::{check_version, Reader, Writer};

/// Container format version.
pub const EVENT_HEAP_VERSION: u32 = 1;

/// Fixed serialized size of one event entry.
const ENTRY_SIZE: usize = 64;

/// Narrative flag bit on [`MacroEventEntry::flags`].
pub const EVENT_FLAG_NARRATIVE: u32 = 1;

/// One scheduled macro event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacroEventEntry {
    /// Unique event id (hash-derived, never 0 for live entries).
    pub event_id: u64,
    /// Domain the event mutates.
    pub domain_id: u64,
    /// Capsule the event mutates.
    pub capsule_id: u64,
    /// Tick the event fires at.
    pub event_time: Tick,
    /// Deterministic ordering key.
    pub order_key: u64,
    /// Sequence number.
    pub sequence: u64,
    /// Event kind tag.
    pub event_kind: u32,
    /// Flag bits; bit 0 marks narrative events.
    pub flags: u32,
    /// First payload word (event index).
    pub payload0: u32,
    /// Second payload word (reason code).
    pub payload1: u32,
}

impl MacroEventEntry {
    fn sort_key(&self) -> (Tick, u64, u64, u64, u64) {
        (
            self.event_time,
            self.order_key,
            self.domain_id,
            self.event_id,
            self.sequence,
        )
    }

    /// True when the narrative flag bit is set.
    #[must_use]
    pub fn is_narrative(&self) -> bool {
        self.flags & EVENT_FLAG_NARRATIVE != 0
    }
}

/// Min-ordered macro event queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroEventHeap {
    entries: Vec<MacroEventEntry>,
    sequence: u64,
}

impl MacroEventHeap {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an event: any entry with the same `(event_id, domain_id)`
    /// is replaced, then the entry is inserted in comparator order.
    pub fn schedule(&mut self, entry: MacroEventEntry) {
        self.entries
            .retain(|e| !(e.event_id == entry.event_id && e.domain_id == entry.domain_id));
        let idx = self
            .entries
            .partition_point(|e| e.sort_key() <= entry.sort_key());
        self.entries.insert(idx, entry);
        self.recompute_sequence();
    }

    /// Returns the head without removing it.
    #[must_use]
    pub fn peek_next(&self) -> Option<MacroEventEntry> {
        self.entries.first().copied()
    }

    /// Removes and returns the head iff its time is within `up_to_time`.
    pub fn pop_next(&mut self, up_to_time: Tick) -> Option<MacroEventEntry> {
        if self.entries.first()?.event_time > up_to_time {
            return None;
        }
        let entry = self.entries.remove(0);
        self.recompute_sequence();
        Some(entry)
    }

    /// Removes every entry belonging to `domain_id`.
    pub fn remove_domain(&mut self, domain_id: u64) {
        self.entries.retain(|e| e.domain_id != domain_id);
        self.recompute_sequence();
    }

    /// True when the queue holds an event for `domain_id`.
    #[must_use]
    pub fn has_domain(&self, domain_id: u64) -> bool {
        self.entries.iter().any(|e| e.domain_id == domain_id)
    }

    /// Copies out the entry at sorted position `index`.
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<MacroEventEntry> {
        self.entries.get(index).copied()
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current queue sequence (max entry sequence).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.sequence = 0;
    }

    fn recompute_sequence(&mut self) {
        self.sequence = self.entries.iter().map(|e| e.sequence).max().unwrap_or(0);
    }

    /// Serializes the queue: `u32 version, u32 count, u64 sequence,
    /// [64-byte entry]*`.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut w = Writer::with_capacity(16 + self.entries.len() * ENTRY_SIZE);
        w.put_u32(EVENT_HEAP_VERSION);
        w.put_u32(self.entries.len() as u32);
        w.put_u64(self.sequence);
        for e in &self.entries {
            w.put_u64(e.event_id);
            w.put_u64(e.domain_id);
            w.put_u64(e.capsule_id);
            w.put_i64(e.event_time);
            w.put_u64(e.order_key);
            w.put_u64(e.sequence);
            w.put_u32(e.event_kind);
            w.put_u32(e.flags);
            w.put_u32(e.payload0);
            w.put_u32(e.payload1);
        }
        w.finish()
    }

    /// Rebuilds a queue from serialized bytes. Each entry is re-scheduled
    /// through [`MacroEventHeap::schedule`] so the ordering is regenerated
    /// rather than trusted.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(bytes);
        check_version(&mut r, EVENT_HEAP_VERSION)?;
        let count = r.get_u32()?;
        let sequence = r.get_u64()?;
        let mut heap = Self::new();
        for _ in 0..count {
            let entry = MacroEventEntry {
                event_id: r.get_u64()?,
                domain_id: r.get_u64()?,
                capsule_id: r.get_u64()?,
                event_time: r.get_i64()?,
                order_key: r.get_u64()?,
                sequence: r.get_u64()?,
                event_kind: r.get_u32()?,
                flags: r.get_u32()?,
                payload0: r.get_u32()?,
                payload1: r.get_u32()?,
            };
            heap.schedule(entry);
        }
        r.expect_end()?;
        heap.sequence = heap.sequence.max(sequence);
        Ok(heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(event_id: u64, domain: u64, time: Tick, order: u64) -> MacroEventEntry {
        MacroEventEntry {
            event_id,
            domain_id: domain,
            event_time: time,
            order_key: order,
            sequence: event_id,
            ..MacroEventEntry::default()
        }
    }

    #[test]
    fn pop_order_is_time_then_order_key() {
        let mut heap = MacroEventHeap::new();
        heap.schedule(ev(3, 1, 10, 5));
        heap.schedule(ev(1, 2, 5, 9));
        heap.schedule(ev(2, 3, 10, 1));
        assert_eq!(heap.pop_next(100).expect("pop").event_id, 1);
        assert_eq!(heap.pop_next(100).expect("pop").event_id, 2);
        assert_eq!(heap.pop_next(100).expect("pop").event_id, 3);
    }

    #[test]
    fn pop_respects_up_to_time() {
        let mut heap = MacroEventHeap::new();
        heap.schedule(ev(1, 1, 50, 0));
        assert!(heap.pop_next(49).is_none());
        assert!(heap.pop_next(50).is_some());
    }

    #[test]
    fn schedule_replaces_same_event_and_domain() {
        let mut heap = MacroEventHeap::new();
        heap.schedule(ev(1, 1, 10, 0));
        heap.schedule(ev(1, 1, 99, 0));
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.peek_next().expect("peek").event_time, 99);
    }

    #[test]
    fn sequence_tracks_max_after_mutation() {
        let mut heap = MacroEventHeap::new();
        heap.schedule(ev(9, 1, 1, 0));
        heap.schedule(ev(4, 2, 2, 0));
        assert_eq!(heap.sequence(), 9);
        heap.remove_domain(1);
        assert_eq!(heap.sequence(), 4);
    }

    #[test]
    fn serialize_roundtrip_regenerates_order() {
        let mut heap = MacroEventHeap::new();
        heap.schedule(ev(3, 1, 10, 5));
        heap.schedule(ev(1, 2, 5, 9));
        let back = MacroEventHeap::deserialize(&heap.serialize()).expect("deserialize");
        assert_eq!(heap, back);
        assert_eq!(back.serialize().len(), 16 + 2 * 64);
    }

    #[test]
    fn remove_domain_only_touches_that_domain() {
        let mut heap = MacroEventHeap::new();
        heap.schedule(ev(1, 1, 1, 0));
        heap.schedule(ev(2, 2, 2, 0));
        heap.remove_domain(1);
        assert!(!heap.has_domain(1));
        assert!(heap.has_domain(2));
    }
}
