// SPDX-License-Identifier: Apache-2.0
//! Cross-shard message log: ordered, idempotent, fixed capacity.
//!
//! Append keeps the log sorted by the full delivery comparator; delivery
//! scans in that order, dropping any message whose `(dest_shard,
//! idempotency_key)` pair was seen before. Seen keys live in a ring so the
//! memory bound is fixed; the log hash covers messages and live keys.

use dominium_scale::hashing::{mix_u64, FNV64_INIT};
use dominium_scale::Tick;

use crate::protocol::ShardId;

/// One cross-shard message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossShardMessage {
    /// Message id minted by the origin shard.
    pub message_id: u64,
    /// Idempotency key; 0 disables deduplication.
    pub idempotency_key: u64,
    /// Shard that sent the message.
    pub origin_shard_id: ShardId,
    /// Shard that must apply the message.
    pub dest_shard_id: ShardId,
    /// Domain the message concerns.
    pub domain_id: u64,
    /// Tick the message was sent.
    pub origin_tick: Tick,
    /// Tick the message becomes deliverable.
    pub delivery_tick: Tick,
    /// Causal grouping key.
    pub causal_key: u64,
    /// Ordering key; 0 defaults to the message id at append.
    pub order_key: u64,
    /// Message kind tag.
    pub message_kind: u32,
    /// Sender sequence number.
    pub sequence: u32,
    /// Hash of the message payload.
    pub payload_hash: u64,
}

impl CrossShardMessage {
    #[allow(clippy::type_complexity)]
    fn sort_key(&self) -> (Tick, u64, ShardId, ShardId, u64, u64, u64, u32, u64) {
        (
            self.delivery_tick,
            self.causal_key,
            self.origin_shard_id,
            self.dest_shard_id,
            self.domain_id,
            self.order_key,
            self.message_id,
            self.sequence,
            self.payload_hash,
        )
    }
}

/// Message kinds.
pub mod message_kind {
    /// Domain ownership moves to the destination shard.
    pub const OWNERSHIP_TRANSFER: u32 = 1;
}

/// One remembered `(dest_shard, idempotency_key)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdempotencyEntry {
    /// Destination shard of the delivered message.
    pub dest_shard_id: ShardId,
    /// Its idempotency key.
    pub idempotency_key: u64,
}

/// The append-only, in-memory cross-shard log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossShardLog {
    messages: Vec<CrossShardMessage>,
    message_capacity: usize,
    message_overflow: u32,
    idempotency: Vec<IdempotencyEntry>,
    idempotency_capacity: usize,
    idempotency_count: u64,
}

impl CrossShardLog {
    /// Creates a log with fixed message and idempotency capacities.
    #[must_use]
    pub fn new(message_capacity: usize, idempotency_capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            message_capacity,
            message_overflow: 0,
            idempotency: Vec::new(),
            idempotency_capacity,
            idempotency_count: 0,
        }
    }

    /// Pending messages in delivery order.
    #[must_use]
    pub fn messages(&self) -> &[CrossShardMessage] {
        &self.messages
    }

    /// Messages dropped because the log was full.
    #[must_use]
    pub fn overflow(&self) -> u32 {
        self.message_overflow
    }

    /// Live idempotency entries (ring order).
    #[must_use]
    pub fn idempotency_entries(&self) -> &[IdempotencyEntry] {
        &self.idempotency
    }

    /// Total idempotency keys ever recorded (monotone, drives the ring).
    #[must_use]
    pub fn idempotency_count(&self) -> u64 {
        self.idempotency_count
    }

    /// Drops all messages and idempotency state.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.message_overflow = 0;
        self.idempotency.clear();
        self.idempotency_count = 0;
    }

    /// Restores log content from a checkpoint copy.
    pub fn restore(
        &mut self,
        messages: &[CrossShardMessage],
        idempotency: &[IdempotencyEntry],
        idempotency_count: u64,
    ) {
        self.messages.clear();
        self.messages.extend_from_slice(messages);
        self.sort();
        self.message_overflow = 0;
        self.idempotency.clear();
        self.idempotency.extend_from_slice(idempotency);
        self.idempotency_count = idempotency_count;
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    fn idempotency_seen(&self, dest_shard_id: ShardId, idempotency_key: u64) -> bool {
        idempotency_key != 0
            && self
                .idempotency
                .iter()
                .any(|e| e.dest_shard_id == dest_shard_id && e.idempotency_key == idempotency_key)
    }

    fn idempotency_record(&mut self, dest_shard_id: ShardId, idempotency_key: u64) {
        if self.idempotency_capacity == 0 || idempotency_key == 0 {
            return;
        }
        let entry = IdempotencyEntry {
            dest_shard_id,
            idempotency_key,
        };
        if self.idempotency.len() < self.idempotency_capacity {
            self.idempotency.push(entry);
        } else {
            let slot = (self.idempotency_count as usize) % self.idempotency_capacity;
            self.idempotency[slot] = entry;
        }
        self.idempotency_count += 1;
    }

    /// Appends a message, defaulting its order key, and re-sorts.
    /// Returns false (and counts overflow) when the log is full.
    pub fn append(&mut self, message: &CrossShardMessage) -> bool {
        if self.message_capacity == 0 || self.messages.len() >= self.message_capacity {
            self.message_overflow += 1;
            return false;
        }
        let mut local = *message;
        if local.order_key == 0 {
            local.order_key = local.message_id;
        }
        self.messages.push(local);
        self.sort();
        true
    }

    /// Pops the next deliverable message with `delivery_tick <= up_to_tick`.
    ///
    /// Messages whose idempotency key was already delivered to the same
    /// destination are removed and counted in `skipped`, not returned.
    pub fn pop_next_ready(&mut self, up_to_tick: Tick) -> (Option<CrossShardMessage>, u32) {
        let mut skipped = 0;
        let mut i = 0;
        while i < self.messages.len() {
            let msg = self.messages[i];
            if msg.delivery_tick > up_to_tick {
                break;
            }
            if self.idempotency_seen(msg.dest_shard_id, msg.idempotency_key) {
                self.messages.remove(i);
                skipped += 1;
                continue;
            }
            self.idempotency_record(msg.dest_shard_id, msg.idempotency_key);
            self.messages.remove(i);
            return (Some(msg), skipped);
        }
        (None, skipped)
    }

    /// Deterministic hash over counts, capacities, overflow, messages, and
    /// live idempotency entries.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hash = FNV64_INIT;
        hash = mix_u64(hash, self.messages.len() as u64);
        hash = mix_u64(hash, self.message_capacity as u64);
        hash = mix_u64(hash, u64::from(self.message_overflow));
        hash = mix_u64(hash, self.idempotency.len() as u64);
        hash = mix_u64(hash, self.idempotency_capacity as u64);
        for msg in &self.messages {
            hash = mix_u64(hash, msg.message_id);
            hash = mix_u64(hash, msg.idempotency_key);
            hash = mix_u64(hash, u64::from(msg.origin_shard_id));
            hash = mix_u64(hash, u64::from(msg.dest_shard_id));
            hash = mix_u64(hash, msg.domain_id);
            hash = mix_u64(hash, msg.origin_tick as u64);
            hash = mix_u64(hash, msg.delivery_tick as u64);
            hash = mix_u64(hash, msg.causal_key);
            hash = mix_u64(hash, msg.order_key);
            hash = mix_u64(hash, u64::from(msg.message_kind));
            hash = mix_u64(hash, u64::from(msg.sequence));
            hash = mix_u64(hash, msg.payload_hash);
        }
        for entry in &self.idempotency {
            hash = mix_u64(hash, u64::from(entry.dest_shard_id));
            hash = mix_u64(hash, entry.idempotency_key);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u64, delivery: Tick, causal: u64, key: u64) -> CrossShardMessage {
        CrossShardMessage {
            message_id: id,
            idempotency_key: key,
            origin_shard_id: 1,
            dest_shard_id: 2,
            delivery_tick: delivery,
            causal_key: causal,
            ..CrossShardMessage::default()
        }
    }

    #[test]
    fn delivery_order_is_tick_then_causal_key() {
        let mut log = CrossShardLog::new(16, 16);
        log.append(&msg(3, 5, 9, 0));
        log.append(&msg(1, 5, 2, 0));
        log.append(&msg(2, 4, 9, 0));
        let (first, _) = log.pop_next_ready(10);
        let (second, _) = log.pop_next_ready(10);
        let (third, _) = log.pop_next_ready(10);
        assert_eq!(first.expect("msg").message_id, 2);
        assert_eq!(second.expect("msg").message_id, 1);
        assert_eq!(third.expect("msg").message_id, 3);
    }

    #[test]
    fn future_messages_stay_queued() {
        let mut log = CrossShardLog::new(16, 16);
        log.append(&msg(1, 10, 0, 0));
        let (none, _) = log.pop_next_ready(9);
        assert!(none.is_none());
        assert_eq!(log.messages().len(), 1);
    }

    #[test]
    fn duplicate_idempotency_key_is_skipped_once() {
        let mut log = CrossShardLog::new(16, 16);
        log.append(&msg(1, 0, 0, 42));
        log.append(&msg(2, 0, 1, 42));
        let (first, skipped) = log.pop_next_ready(0);
        assert!(first.is_some());
        assert_eq!(skipped, 0);
        let (second, skipped) = log.pop_next_ready(0);
        assert!(second.is_none());
        assert_eq!(skipped, 1);
        assert!(log.messages().is_empty());
    }

    #[test]
    fn key_zero_never_dedupes() {
        let mut log = CrossShardLog::new(16, 16);
        log.append(&msg(1, 0, 0, 0));
        log.append(&msg(2, 0, 1, 0));
        assert!(log.pop_next_ready(0).0.is_some());
        assert!(log.pop_next_ready(0).0.is_some());
    }

    #[test]
    fn order_key_defaults_to_message_id() {
        let mut log = CrossShardLog::new(16, 16);
        log.append(&msg(7, 0, 0, 0));
        assert_eq!(log.messages()[0].order_key, 7);
    }

    #[test]
    fn overflow_counts_drops() {
        let mut log = CrossShardLog::new(1, 16);
        assert!(log.append(&msg(1, 0, 0, 0)));
        assert!(!log.append(&msg(2, 0, 0, 0)));
        assert_eq!(log.overflow(), 1);
    }

    #[test]
    fn idempotency_ring_wraps() {
        let mut log = CrossShardLog::new(16, 2);
        for i in 1..=3u64 {
            log.append(&msg(i, 0, i, 100 + i));
            let _ = log.pop_next_ready(0);
        }
        assert_eq!(log.idempotency_entries().len(), 2);
        assert_eq!(log.idempotency_count(), 3);
        // Key 101 was evicted; a replay of it delivers again.
        log.append(&msg(9, 0, 9, 101));
        assert!(log.pop_next_ready(0).0.is_some());
    }

    #[test]
    fn hash_tracks_content() {
        let mut a = CrossShardLog::new(16, 16);
        let mut b = CrossShardLog::new(16, 16);
        assert_eq!(a.hash(), b.hash());
        a.append(&msg(1, 0, 0, 5));
        assert_ne!(a.hash(), b.hash());
        b.append(&msg(1, 0, 0, 5));
        assert_eq!(a.hash(), b.hash());
    }
}
