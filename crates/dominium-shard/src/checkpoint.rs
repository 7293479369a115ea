// SPDX-License-Identifier: Apache-2.0
//! Checkpoint capture and recovery.
//!
//! A checkpoint is a full restorable image: a manifest of hashes and
//! counters, a deep clone of every shard's scale engine, and verbatim
//! copies of the runtime's intents, deferred queue, events, owners,
//! messages, and lifecycle log. The store is a ring: recording into a
//! full store disposes the oldest record and counts overflow.
//!
//! Recovery is shadow-first. Every validation runs before anything is
//! swapped in, so a rejected record leaves the runtime untouched.

use dominium_scale::hashing::{mix_u64, FNV64_INIT};
use dominium_scale::{BudgetSnapshot, ScaleEngine, Tick};
use thiserror::Error;

use crate::cross_shard::{CrossShardMessage, IdempotencyEntry};
use crate::lifecycle::{LifecycleEntry, LifecycleLog, LifecycleState};
use crate::protocol::{Intent, RuntimeEvent, RuntimeRefusal, ShardId};
use crate::runtime::{limits, DeferredIntent, DomainOwner, Runtime, RuntimeError};

/// Checkpoint record schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Default ring capacity.
pub const CHECKPOINT_MAX_RECORDS: usize = 32;

/// Why a checkpoint was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TriggerReason {
    /// Tick-interval policy fired.
    PolicyTick = 1,
    /// Macro-event-stride policy fired.
    PolicyMacro = 2,
    /// Captured ahead of an ownership transfer.
    BeforeTransfer = 3,
    /// Operator-requested.
    Manual = 4,
    /// Captured as part of a recovery.
    Recovery = 5,
}

/// Checkpoint cadence policy. Carried in the runtime config; capture is
/// invoked explicitly by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Capture every N ticks (0 disables).
    pub interval_ticks: u32,
    /// Capture every N macro events (0 disables).
    pub macro_event_stride: u32,
    /// Capture before ownership transfers.
    pub checkpoint_before_transfer: bool,
    /// Ring capacity.
    pub max_records: u32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            interval_ticks: 0,
            macro_event_stride: 0,
            checkpoint_before_transfer: false,
            max_records: CHECKPOINT_MAX_RECORDS as u32,
        }
    }
}

/// Manifest: identity and integrity anchors of one checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointManifest {
    /// Schema version of the record layout.
    pub schema_version: u32,
    /// Deterministic checkpoint id.
    pub checkpoint_id: u64,
    /// Tick the checkpoint was captured at.
    pub tick: Tick,
    /// Why it was captured (`TriggerReason as u32`).
    pub trigger_reason: u32,
    /// World-definition hash of the capturing runtime.
    pub worlddef_hash: u64,
    /// Capability-lock hash of the capturing runtime.
    pub capability_lock_hash: u64,
    /// Runtime hash at capture.
    pub runtime_hash: u64,
    /// Lifecycle log hash at capture.
    pub lifecycle_hash: u64,
    /// Message sequence at capture.
    pub message_sequence: u64,
    /// Messages applied at capture.
    pub message_applied: u64,
    /// Macro events executed at capture.
    pub macro_events_executed: u64,
    /// Audit event count at capture.
    pub event_count: u32,
    /// Audit event overflow at capture.
    pub event_overflow: u32,
    /// Shard count of the capturing runtime.
    pub shard_count: u32,
}

/// One shard's captured state.
#[derive(Debug, Clone)]
pub struct ShardCheckpoint {
    /// Shard id.
    pub shard_id: ShardId,
    /// Capture tick.
    pub tick: Tick,
    /// Lifecycle state at capture.
    pub lifecycle_state: LifecycleState,
    /// Shard version id.
    pub version_id: u32,
    /// Shard capability mask.
    pub capability_mask: u64,
    /// Shard baseline hash.
    pub baseline_hash: u64,
    /// Deep clone of the shard's scale engine (domains, stores, budget,
    /// scale event log).
    pub engine: ScaleEngine,
    /// Budget snapshot at capture.
    pub budget_snapshot: BudgetSnapshot,
    /// Per-domain hashes at capture, in domain order.
    pub domain_hashes: Vec<u64>,
    /// Per-domain capsule ids at capture, in domain order.
    pub capsule_ids: Vec<u64>,
    /// Scale event log hash at capture.
    pub scale_event_hash: u64,
    /// Combined shard hash.
    pub shard_hash: u64,
}

/// One restorable image.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Manifest.
    pub manifest: CheckpointManifest,
    /// Per-shard captures, in shard order.
    pub shards: Vec<ShardCheckpoint>,
    /// Lifecycle log entries at capture.
    pub lifecycle_entries: Vec<LifecycleEntry>,
    /// Lifecycle log overflow at capture.
    pub lifecycle_overflow: u32,
    /// Pending intents at capture.
    pub intents: Vec<Intent>,
    /// Intent overflow at capture.
    pub intent_overflow: u32,
    /// Deferred intents at capture.
    pub deferred: Vec<DeferredIntent>,
    /// Deferred overflow at capture.
    pub deferred_overflow: u32,
    /// Audit events at capture.
    pub events: Vec<RuntimeEvent>,
    /// Audit event overflow at capture.
    pub event_overflow: u32,
    /// Owner table at capture.
    pub owners: Vec<DomainOwner>,
    /// Cross-shard messages at capture.
    pub messages: Vec<CrossShardMessage>,
    /// Cross-shard idempotency entries at capture.
    pub idempotency: Vec<IdempotencyEntry>,
    /// Cross-shard idempotency counter at capture.
    pub idempotency_count: u64,
}

/// Ring-buffered checkpoint store.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    records: Vec<CheckpointRecord>,
    capacity: usize,
    overflow: u32,
}

impl CheckpointStore {
    /// Creates a store holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity,
            overflow: 0,
        }
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records disposed because the ring was full.
    #[must_use]
    pub fn overflow(&self) -> u32 {
        self.overflow
    }

    /// The most recent record.
    #[must_use]
    pub fn last(&self) -> Option<&CheckpointRecord> {
        self.records.last()
    }

    /// Retains a record, disposing the oldest when full.
    pub fn record(&mut self, record: CheckpointRecord) {
        if self.capacity == 0 {
            self.overflow += 1;
            return;
        }
        if self.records.len() >= self.capacity {
            self.records.remove(0);
            self.overflow += 1;
        }
        self.records.push(record);
    }

    /// Deterministic hash over count, overflow, and every manifest plus
    /// shard hash.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hash = FNV64_INIT;
        hash = mix_u64(hash, self.records.len() as u64);
        hash = mix_u64(hash, u64::from(self.overflow));
        for record in &self.records {
            let m = &record.manifest;
            hash = mix_u64(hash, u64::from(m.schema_version));
            hash = mix_u64(hash, m.checkpoint_id);
            hash = mix_u64(hash, m.tick as u64);
            hash = mix_u64(hash, u64::from(m.trigger_reason));
            hash = mix_u64(hash, m.runtime_hash);
            hash = mix_u64(hash, m.lifecycle_hash);
            hash = mix_u64(hash, m.message_sequence);
            hash = mix_u64(hash, m.message_applied);
            hash = mix_u64(hash, m.macro_events_executed);
            hash = mix_u64(hash, u64::from(m.event_count));
            hash = mix_u64(hash, u64::from(m.event_overflow));
            hash = mix_u64(hash, u64::from(m.shard_count));
            for shard in &record.shards {
                hash = mix_u64(hash, shard.shard_hash);
            }
        }
        hash
    }
}

/// Why a recovery was refused. The record is rejected wholesale; the
/// runtime is left untouched.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("checkpoint recovery refused ({refusal:?}): {reason}")]
pub struct RecoverError {
    /// Refusal code classifying the rejection.
    pub refusal: RuntimeRefusal,
    /// Human-readable validation that failed.
    pub reason: &'static str,
}

fn shard_hash(chk: &ShardCheckpoint) -> u64 {
    let mut hash = FNV64_INIT;
    hash = mix_u64(hash, u64::from(chk.shard_id));
    hash = mix_u64(hash, chk.tick as u64);
    hash = mix_u64(hash, u64::from(chk.lifecycle_state as u32));
    hash = mix_u64(hash, u64::from(chk.version_id));
    hash = mix_u64(hash, chk.capability_mask);
    hash = mix_u64(hash, chk.baseline_hash);
    hash = mix_u64(hash, chk.scale_event_hash);
    for h in &chk.domain_hashes {
        hash = mix_u64(hash, *h);
    }
    for id in &chk.capsule_ids {
        hash = mix_u64(hash, *id);
    }
    hash
}

fn checkpoint_id(runtime: &Runtime, trigger_reason: u32, runtime_hash: u64) -> u64 {
    let mut hash = FNV64_INIT;
    hash = mix_u64(hash, runtime.now_tick as u64);
    hash = mix_u64(hash, u64::from(trigger_reason));
    hash = mix_u64(hash, runtime_hash);
    mix_u64(hash, runtime.message_sequence)
}

/// Captures a full restorable image of `runtime`.
#[must_use]
pub fn capture(runtime: &Runtime, trigger_reason: TriggerReason) -> CheckpointRecord {
    let runtime_hash = runtime.runtime_hash();
    let lifecycle_hash = runtime.lifecycle_log.hash();
    let manifest = CheckpointManifest {
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        checkpoint_id: checkpoint_id(runtime, trigger_reason as u32, runtime_hash),
        tick: runtime.now_tick,
        trigger_reason: trigger_reason as u32,
        worlddef_hash: runtime.config.worlddef_hash,
        capability_lock_hash: runtime.config.capability_lock_hash,
        runtime_hash,
        lifecycle_hash,
        message_sequence: runtime.message_sequence,
        message_applied: runtime.message_applied,
        macro_events_executed: runtime.macro_events_executed,
        event_count: runtime.events.len() as u32,
        event_overflow: runtime.event_overflow,
        shard_count: runtime.shards.len() as u32,
    };
    let shards = runtime
        .shards
        .iter()
        .map(|shard| {
            let engine = shard.engine.clone();
            let domain_hashes = engine
                .domains()
                .iter()
                .map(|slot| dominium_scale::domain_hash(slot, runtime.now_tick, engine.worker_count()))
                .collect();
            let capsule_ids = engine.domains().iter().map(|slot| slot.capsule_id).collect();
            let mut chk = ShardCheckpoint {
                shard_id: shard.shard_id,
                tick: runtime.now_tick,
                lifecycle_state: shard.lifecycle_state,
                version_id: shard.version_id,
                capability_mask: shard.capability_mask,
                baseline_hash: shard.baseline_hash,
                budget_snapshot: engine.budget_snapshot(),
                scale_event_hash: engine.event_log().hash(),
                domain_hashes,
                capsule_ids,
                engine,
                shard_hash: 0,
            };
            chk.shard_hash = shard_hash(&chk);
            chk
        })
        .collect();
    CheckpointRecord {
        manifest,
        shards,
        lifecycle_entries: runtime.lifecycle_log.entries().to_vec(),
        lifecycle_overflow: runtime.lifecycle_log.overflow(),
        intents: runtime.intents.clone(),
        intent_overflow: runtime.intent_overflow,
        deferred: runtime.deferred.clone(),
        deferred_overflow: runtime.deferred_overflow,
        events: runtime.events.clone(),
        event_overflow: runtime.event_overflow,
        owners: runtime.owners.clone(),
        messages: runtime.message_log.messages().to_vec(),
        idempotency: runtime.message_log.idempotency_entries().to_vec(),
        idempotency_count: runtime.message_log.idempotency_count(),
    }
}

/// Restores `runtime` from `record` after full validation.
pub fn recover(runtime: &mut Runtime, record: &CheckpointRecord) -> Result<(), RecoverError> {
    if record.manifest.schema_version != CHECKPOINT_SCHEMA_VERSION {
        return Err(RecoverError {
            refusal: RuntimeRefusal::CapabilityMissing,
            reason: "schema version mismatch",
        });
    }
    if record.lifecycle_entries.len() > limits::LIFECYCLE_ENTRIES {
        return Err(RecoverError {
            refusal: RuntimeRefusal::IntegrityViolation,
            reason: "lifecycle log exceeds capacity",
        });
    }
    // Recompute the lifecycle hash over the record's own entries; a record
    // whose manifest disagrees with its content is corrupt.
    let mut lifecycle_view = LifecycleLog::new(limits::LIFECYCLE_ENTRIES);
    lifecycle_view.restore(&record.lifecycle_entries, record.lifecycle_overflow);
    if lifecycle_view.hash() != record.manifest.lifecycle_hash {
        return Err(RecoverError {
            refusal: RuntimeRefusal::IntegrityViolation,
            reason: "lifecycle hash mismatch",
        });
    }
    if record.manifest.worlddef_hash != runtime.config.worlddef_hash
        || record.manifest.capability_lock_hash != runtime.config.capability_lock_hash
    {
        return Err(RecoverError {
            refusal: RuntimeRefusal::CapabilityMissing,
            reason: "world definition or capability lock mismatch",
        });
    }
    if record.manifest.shard_count as usize != runtime.shards.len()
        || record.shards.len() != runtime.shards.len()
    {
        return Err(RecoverError {
            refusal: RuntimeRefusal::InvalidIntent,
            reason: "shard count mismatch",
        });
    }
    if record.intents.len() > limits::MAX_INTENTS
        || record.deferred.len() > limits::MAX_DEFERRED
        || record.events.len() > limits::MAX_EVENTS
        || record.owners.len() > limits::MAX_DOMAIN_OWNERS
        || record.messages.len() > limits::MAX_MESSAGES
        || record.idempotency.len() > limits::MAX_IDEMPOTENCY
    {
        return Err(RecoverError {
            refusal: RuntimeRefusal::IntegrityViolation,
            reason: "table shape exceeds limits",
        });
    }
    for (shard, chk) in runtime.shards.iter().zip(&record.shards) {
        if chk.shard_id != shard.shard_id {
            return Err(RecoverError {
                refusal: RuntimeRefusal::InvalidIntent,
                reason: "shard id mismatch",
            });
        }
        if chk.engine.event_log().len() > limits::SCALE_EVENTS_PER_SHARD {
            return Err(RecoverError {
                refusal: RuntimeRefusal::IntegrityViolation,
                reason: "scale event log exceeds capacity",
            });
        }
    }

    // Validation passed: install the clones, then the runtime tables
    // verbatim, then reset every client budget for the restored tick.
    let tick = record.manifest.tick;
    for (shard, chk) in runtime.shards.iter_mut().zip(&record.shards) {
        shard.engine = chk.engine.clone();
        shard.engine.begin_tick(tick);
        shard.lifecycle_state = chk.lifecycle_state;
        shard.version_id = chk.version_id;
        shard.capability_mask = chk.capability_mask;
        shard.baseline_hash = chk.baseline_hash;
    }
    runtime.now_tick = tick;
    runtime.message_sequence = record.manifest.message_sequence;
    runtime.message_applied = record.manifest.message_applied;
    runtime.macro_events_executed = record.manifest.macro_events_executed;
    runtime.intents = record.intents.clone();
    runtime.intent_overflow = record.intent_overflow;
    runtime.deferred = record.deferred.clone();
    runtime.deferred_overflow = record.deferred_overflow;
    runtime.events = record.events.clone();
    runtime.event_overflow = record.event_overflow;
    runtime.owners = record.owners.clone();
    runtime.rebuild_owner_index();
    runtime
        .message_log
        .restore(&record.messages, &record.idempotency, record.idempotency_count);
    runtime
        .lifecycle_log
        .restore(&record.lifecycle_entries, record.lifecycle_overflow);
    for client in &mut runtime.clients {
        client.reset_for_recovery(tick);
    }
    Ok(())
}

impl Runtime {
    /// Captures a checkpoint and retains it in the ring store. Returns
    /// the checkpoint id.
    pub fn checkpoint(&mut self, trigger_reason: TriggerReason) -> u64 {
        let record = capture(self, trigger_reason);
        let id = record.manifest.checkpoint_id;
        self.checkpoints.record(record);
        id
    }

    /// Restores the most recent checkpoint.
    pub fn recover_last(&mut self) -> Result<(), RuntimeError> {
        let record = self
            .checkpoints
            .last()
            .cloned()
            .ok_or(RuntimeError::NoCheckpoint)?;
        recover(self, &record).map_err(RuntimeError::from)
    }

    /// The most recent checkpoint, if any.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<&CheckpointRecord> {
        self.checkpoints.last()
    }

    /// The checkpoint store's aggregate hash.
    #[must_use]
    pub fn checkpoint_hash(&self) -> u64 {
        self.checkpoints.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Intent, IntentKind};
    use crate::runtime::RuntimeConfig;

    fn runtime_with_activity() -> Runtime {
        let mut runtime = Runtime::new(RuntimeConfig {
            shard_count: 2,
            ..RuntimeConfig::default()
        });
        runtime.add_client(1, 1, None).expect("client");
        let domain = runtime.shard_domain_ids(1).expect("ids")[0];
        runtime
            .submit_intent(
                &Intent {
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: domain,
                    intent_kind: IntentKind::Collapse as u32,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
        runtime.tick(1).expect("tick");
        runtime
    }

    #[test]
    fn capture_then_mutate_then_recover_restores_hash() {
        let mut runtime = runtime_with_activity();
        let hash_at_capture = runtime.runtime_hash();
        runtime.checkpoint(TriggerReason::Manual);

        let domain = runtime.shard_domain_ids(1).expect("ids")[0];
        let capsule = runtime
            .shard_engine(1)
            .expect("engine")
            .domain(domain)
            .expect("slot")
            .capsule_id;
        runtime
            .submit_intent(
                &Intent {
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: domain,
                    capsule_id: capsule,
                    intent_kind: IntentKind::Expand as u32,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
        runtime.tick(4).expect("tick");
        assert_ne!(runtime.runtime_hash(), hash_at_capture);

        runtime.recover_last().expect("recover");
        assert_eq!(runtime.runtime_hash(), hash_at_capture);
        assert_eq!(runtime.now_tick(), 1);
    }

    #[test]
    fn recovery_validates_schema_and_lifecycle_hash() {
        let mut runtime = runtime_with_activity();
        runtime.checkpoint(TriggerReason::Manual);
        let mut record = runtime.last_checkpoint().expect("record").clone();
        record.manifest.schema_version = 99;
        let err = recover(&mut runtime, &record).expect_err("schema must fail");
        assert_eq!(err.refusal, RuntimeRefusal::CapabilityMissing);

        let mut record = runtime.last_checkpoint().expect("record").clone();
        record.manifest.lifecycle_hash ^= 1;
        let err = recover(&mut runtime, &record).expect_err("lifecycle must fail");
        assert_eq!(err.refusal, RuntimeRefusal::IntegrityViolation);
    }

    #[test]
    fn ring_disposes_oldest_and_counts_overflow() {
        let mut store = CheckpointStore::new(2);
        let runtime = runtime_with_activity();
        for _ in 0..3 {
            store.record(capture(&runtime, TriggerReason::Manual));
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.overflow(), 1);
    }

    #[test]
    fn recover_without_checkpoint_is_an_error() {
        let mut runtime = runtime_with_activity();
        assert_eq!(runtime.recover_last(), Err(RuntimeError::NoCheckpoint));
    }

    #[test]
    fn store_hash_tracks_records() {
        let runtime = runtime_with_activity();
        let mut a = CheckpointStore::new(4);
        let b = CheckpointStore::new(4);
        assert_eq!(a.hash(), b.hash());
        a.record(capture(&runtime, TriggerReason::Manual));
        assert_ne!(a.hash(), b.hash());
    }
}
