// SPDX-License-Identifier: Apache-2.0
//! The authoritative multi-shard runtime.
//!
//! One runtime owns up to four shards, each wrapping a [`ScaleEngine`]
//! seeded with three domains. Intents are admitted through client rate
//! budgets, drained once per tick in a strict total order, and every
//! decision lands in the audit event log. The runtime hash folds the full
//! observable state, so two runtimes fed the same intents in any
//! submission order agree after every tick.

use dominium_scale::hashing::{mix_u64, FNV64_INIT};
use dominium_scale::{
    AgentEntry, BudgetPolicy, BudgetSnapshot, CommitToken, DeferCode, DomainPayload, DomainSlot,
    FidelityTier, MacroPolicy, NetworkEdge, NetworkNode, OperationResult, ResourceEntry,
    ScaleEngine, Tick,
};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::checkpoint::{CheckpointPolicy, CheckpointStore};
use crate::cross_shard::{message_kind, CrossShardLog, CrossShardMessage};
use crate::global_id::{namespace, GlobalIdGen};
use crate::lifecycle::{LifecycleLog, LifecycleState, TransitionError};
use crate::protocol::{
    runtime_detail, ClientBudgetState, ClientPolicy, Intent, IntentKind, JoinBundle, ResyncBundle,
    RuntimeEvent, RuntimeEventKind, RuntimeRefusal, ShardId, SnapshotFragment,
};

/// Hard deterministic sizing bounds.
pub mod limits {
    /// Maximum shards per runtime.
    pub const MAX_SHARDS: usize = 4;
    /// Maximum clients per runtime.
    pub const MAX_CLIENTS: usize = 16;
    /// Seeded domains per shard.
    pub const DOMAINS_PER_SHARD: usize = 3;
    /// Audit event log capacity.
    pub const MAX_EVENTS: usize = 4096;
    /// Pending intent table capacity.
    pub const MAX_INTENTS: usize = 1024;
    /// Runtime deferred-intent capacity.
    pub const MAX_DEFERRED: usize = 256;
    /// Owner table capacity.
    pub const MAX_DOMAIN_OWNERS: usize = 64;
    /// Cross-shard message log capacity.
    pub const MAX_MESSAGES: usize = 2048;
    /// Cross-shard idempotency ring capacity.
    pub const MAX_IDEMPOTENCY: usize = 2048;
    /// Per-client idempotency window.
    pub const CLIENT_IDEMPOTENCY_WINDOW: usize = 256;
    /// Scale event log capacity per shard.
    pub const SCALE_EVENTS_PER_SHARD: usize = 256;
    /// Lifecycle log capacity.
    pub const LIFECYCLE_ENTRIES: usize = 256;
}

/// Runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Tick the runtime starts at.
    pub start_tick: Tick,
    /// Number of shards (clamped to `1..=MAX_SHARDS`).
    pub shard_count: u32,
    /// Declared worker count (hashing parameter only).
    pub worker_count: u32,
    /// World-definition hash checkpoints must match.
    pub worlddef_hash: u64,
    /// Capability-lock hash checkpoints must match.
    pub capability_lock_hash: u64,
    /// Scale budget policy installed on every shard.
    pub scale_budget_policy: BudgetPolicy,
    /// Macro pacing policy installed on every shard.
    pub macro_policy: MacroPolicy,
    /// Checkpoint cadence policy (carried; capture is explicit).
    pub checkpoint_policy: CheckpointPolicy,
    /// Version id stamped on every shard.
    pub shard_version_id: u32,
    /// Capability mask stamped on every shard.
    pub shard_capability_mask: u64,
    /// Baseline hash stamped on every shard.
    pub shard_baseline_hash: u64,
    /// Policy for clients added without an explicit one.
    pub default_client_policy: ClientPolicy,
    /// Runtime deferred-intent limit (0 uses `MAX_DEFERRED`).
    pub deferred_limit: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            start_tick: 0,
            shard_count: 1,
            worker_count: 1,
            worlddef_hash: 0,
            capability_lock_hash: 0,
            scale_budget_policy: BudgetPolicy {
                min_dwell_ticks: 0,
                ..BudgetPolicy::default()
            },
            macro_policy: MacroPolicy::default(),
            checkpoint_policy: CheckpointPolicy::default(),
            shard_version_id: 1,
            shard_capability_mask: 1,
            shard_baseline_hash: 0,
            default_client_policy: ClientPolicy::default(),
            deferred_limit: limits::MAX_DEFERRED as u32,
        }
    }
}

/// Parameter-level misuse of the runtime API.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// Client id 0 is reserved.
    #[error("client id 0 is reserved")]
    ZeroClientId,
    /// No shard with this id exists.
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),
    /// No client with this id exists.
    #[error("unknown client {0}")]
    UnknownClient(u64),
    /// The client id is already registered.
    #[error("duplicate client {0}")]
    DuplicateClient(u64),
    /// The client table is full.
    #[error("client table full")]
    ClientTableFull,
    /// The intent table is full.
    #[error("intent table full")]
    IntentTableFull,
    /// The target tick is in the past.
    #[error("tick {requested} is before current tick {current}")]
    TickInPast {
        /// Requested target tick.
        requested: Tick,
        /// Current runtime tick.
        current: Tick,
    },
    /// A lifecycle transition was forbidden.
    #[error(transparent)]
    Lifecycle(#[from] TransitionError),
    /// No checkpoint is available to recover from.
    #[error("no checkpoint recorded")]
    NoCheckpoint,
    /// A checkpoint recovery was refused.
    #[error(transparent)]
    Recover(#[from] crate::checkpoint::RecoverError),
}

/// One connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Client {
    pub(crate) client_id: u64,
    pub(crate) shard_id: ShardId,
    pub(crate) policy: ClientPolicy,
    pub(crate) budget: ClientBudgetState,
    pub(crate) idempotency_keys: Vec<u64>,
    pub(crate) idempotency_count: u64,
}

impl Client {
    fn new(client_id: u64, shard_id: ShardId, policy: ClientPolicy) -> Self {
        Self {
            client_id,
            shard_id,
            policy,
            budget: ClientBudgetState::default(),
            idempotency_keys: Vec::new(),
            idempotency_count: 0,
        }
    }

    pub(crate) fn budget_reset(&mut self, tick: Tick) {
        self.budget = ClientBudgetState {
            tick,
            intents_limit: self.policy.intents_per_tick,
            intents_used: 0,
            bytes_limit: self.policy.bytes_per_tick,
            bytes_used: 0,
        };
    }

    fn idempotent_seen(&self, key: u64) -> bool {
        key != 0 && self.idempotency_keys.contains(&key)
    }

    fn idempotent_record(&mut self, key: u64) {
        if key == 0 {
            return;
        }
        if self.idempotency_keys.len() < limits::CLIENT_IDEMPOTENCY_WINDOW {
            self.idempotency_keys.push(key);
        } else {
            let slot = (self.idempotency_count as usize) % limits::CLIENT_IDEMPOTENCY_WINDOW;
            self.idempotency_keys[slot] = key;
        }
        self.idempotency_count += 1;
    }

    pub(crate) fn reset_for_recovery(&mut self, tick: Tick) {
        self.budget_reset(tick);
        self.idempotency_keys.clear();
        self.idempotency_count = 0;
    }
}

/// One hosted shard: a scale engine plus identity and lifecycle.
#[derive(Debug, Clone)]
pub(crate) struct ShardHost {
    pub(crate) shard_id: ShardId,
    pub(crate) engine: ScaleEngine,
    pub(crate) id_gen: GlobalIdGen,
    pub(crate) lifecycle_state: LifecycleState,
    pub(crate) version_id: u32,
    pub(crate) capability_mask: u64,
    pub(crate) baseline_hash: u64,
}

/// One deferred intent awaiting a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredIntent {
    /// The re-queued intent (its tick moved to `now + 1`).
    pub intent: Intent,
    /// The defer code that caused the re-queue.
    pub defer_code: u32,
}

/// One owner-table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainOwner {
    /// Domain id.
    pub domain_id: u64,
    /// Shard that exclusively owns the domain.
    pub owner_shard_id: ShardId,
}

/// The authoritative runtime.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) now_tick: Tick,
    pub(crate) macro_events_executed: u64,
    pub(crate) shards: Vec<ShardHost>,
    pub(crate) clients: Vec<Client>,
    pub(crate) lifecycle_log: LifecycleLog,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) intents: Vec<Intent>,
    pub(crate) intent_overflow: u32,
    pub(crate) deferred: Vec<DeferredIntent>,
    pub(crate) deferred_overflow: u32,
    pub(crate) owners: Vec<DomainOwner>,
    // Process-local lookup acceleration; never serialized, never hashed.
    pub(crate) owner_index: FxHashMap<u64, usize>,
    pub(crate) events: Vec<RuntimeEvent>,
    pub(crate) event_overflow: u32,
    pub(crate) message_log: CrossShardLog,
    pub(crate) message_sequence: u64,
    pub(crate) message_applied: u64,
}

fn seed_resource_domain(domain_id: u64, bias: u32) -> DomainSlot {
    DomainSlot::new(
        domain_id,
        FidelityTier::Meso,
        DomainPayload::Resources(vec![
            ResourceEntry {
                resource_id: domain_id + 1,
                quantity: 100 + u64::from(bias),
            },
            ResourceEntry {
                resource_id: domain_id + 2,
                quantity: 5 + u64::from(bias % 7),
            },
            ResourceEntry {
                resource_id: domain_id + 3,
                quantity: 2000 + u64::from(bias % 13),
            },
        ]),
    )
}

fn seed_network_domain(domain_id: u64, bias: u32) -> DomainSlot {
    let nodes = vec![
        NetworkNode {
            node_id: domain_id + 10,
            node_kind: 1,
        },
        NetworkNode {
            node_id: domain_id + 20,
            node_kind: 1,
        },
    ];
    let edges = vec![
        NetworkEdge {
            edge_id: domain_id + 100,
            from_node_id: domain_id + 10,
            to_node_id: domain_id + 20,
            capacity_units: 1000 + u64::from(bias % 31),
            buffer_units: 200 + u64::from(bias % 17),
            wear_buckets: [1, 2, 3, 4],
        },
        NetworkEdge {
            edge_id: domain_id + 200,
            from_node_id: domain_id + 20,
            to_node_id: domain_id + 10,
            capacity_units: 500 + u64::from(bias % 19),
            buffer_units: 100 + u64::from(bias % 11),
            wear_buckets: [2, 1, 1, 0],
        },
    ];
    DomainSlot::new(
        domain_id,
        FidelityTier::Micro,
        DomainPayload::Network { nodes, edges },
    )
}

fn seed_agent_domain(domain_id: u64, bias: u32) -> DomainSlot {
    DomainSlot::new(
        domain_id,
        FidelityTier::Meso,
        DomainPayload::Agents(vec![
            AgentEntry {
                agent_id: domain_id + 1,
                role_id: 1,
                trait_mask: 1,
                planning_bucket: 2,
            },
            AgentEntry {
                agent_id: domain_id + 2,
                role_id: 1,
                trait_mask: 2 + (bias % 3),
                planning_bucket: 1,
            },
            AgentEntry {
                agent_id: domain_id + 3,
                role_id: 2,
                trait_mask: 1,
                planning_bucket: 3,
            },
            AgentEntry {
                agent_id: domain_id + 4,
                role_id: 2,
                trait_mask: 1,
                planning_bucket: 1,
            },
        ]),
    )
}

impl Runtime {
    /// Builds a runtime: shards are seeded, owners registered, budgets
    /// armed for the start tick.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let mut config = config;
        config.shard_count = config.shard_count.clamp(1, limits::MAX_SHARDS as u32);
        let mut runtime = Self {
            config,
            now_tick: config.start_tick,
            macro_events_executed: 0,
            shards: Vec::new(),
            clients: Vec::new(),
            lifecycle_log: LifecycleLog::new(limits::LIFECYCLE_ENTRIES),
            checkpoints: CheckpointStore::new(config.checkpoint_policy.max_records as usize),
            intents: Vec::new(),
            intent_overflow: 0,
            deferred: Vec::new(),
            deferred_overflow: 0,
            owners: Vec::new(),
            owner_index: FxHashMap::default(),
            events: Vec::new(),
            event_overflow: 0,
            message_log: CrossShardLog::new(limits::MAX_MESSAGES, limits::MAX_IDEMPOTENCY),
            message_sequence: 0,
            message_applied: 0,
        };
        for i in 0..config.shard_count {
            let shard_id = i + 1;
            let host = runtime.build_shard(shard_id);
            let domain_ids: Vec<u64> = host.engine.domains().iter().map(|d| d.domain_id).collect();
            runtime.shards.push(host);
            for domain_id in domain_ids {
                runtime.owner_set(domain_id, shard_id);
            }
        }
        runtime
    }

    fn build_shard(&self, shard_id: ShardId) -> ShardHost {
        let config = &self.config;
        let bias = shard_id * 13;
        let mut id_gen = GlobalIdGen::new(shard_id as u16);
        let resource_id = id_gen.next_packed(namespace::DOMAIN).unwrap_or(1);
        let network_id = id_gen.next_packed(namespace::DOMAIN).unwrap_or(2);
        let agents_id = id_gen.next_packed(namespace::DOMAIN).unwrap_or(3);

        let mut engine = ScaleEngine::new(
            config.start_tick,
            config.worker_count,
            limits::SCALE_EVENTS_PER_SHARD,
        );
        engine.set_budget_policy(config.scale_budget_policy);
        engine.set_macro_policy(config.macro_policy);
        let _ = engine.register_domain(seed_resource_domain(resource_id, bias));
        let _ = engine.register_domain(seed_network_domain(network_id, bias + 7));
        let _ = engine.register_domain(seed_agent_domain(agents_id, bias + 11));
        engine.begin_tick(config.start_tick);

        ShardHost {
            shard_id,
            engine,
            id_gen,
            lifecycle_state: LifecycleState::Active,
            version_id: config.shard_version_id,
            capability_mask: config.shard_capability_mask,
            baseline_hash: config.shard_baseline_hash,
        }
    }

    /// Current tick.
    #[must_use]
    pub fn now_tick(&self) -> Tick {
        self.now_tick
    }

    /// Number of hosted shards.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Macro events executed through MACRO_ADVANCE intents.
    #[must_use]
    pub fn macro_events_executed(&self) -> u64 {
        self.macro_events_executed
    }

    /// Audit events in emission order.
    #[must_use]
    pub fn events(&self) -> &[RuntimeEvent] {
        &self.events
    }

    /// Audit events dropped on overflow.
    #[must_use]
    pub fn event_overflow(&self) -> u32 {
        self.event_overflow
    }

    /// Pending (future) intents.
    #[must_use]
    pub fn pending_intents(&self) -> &[Intent] {
        &self.intents
    }

    /// Runtime-level deferred intents.
    #[must_use]
    pub fn deferred_intents(&self) -> &[DeferredIntent] {
        &self.deferred
    }

    /// Owner table in registration order.
    #[must_use]
    pub fn owners(&self) -> &[DomainOwner] {
        &self.owners
    }

    /// The cross-shard message log.
    #[must_use]
    pub fn message_log(&self) -> &CrossShardLog {
        &self.message_log
    }

    /// Messages minted so far.
    #[must_use]
    pub fn message_sequence(&self) -> u64 {
        self.message_sequence
    }

    /// Messages applied so far.
    #[must_use]
    pub fn message_applied(&self) -> u64 {
        self.message_applied
    }

    /// The lifecycle transition log.
    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.lifecycle_log
    }

    /// A shard's scale engine.
    pub fn shard_engine(&self, shard_id: ShardId) -> Result<&ScaleEngine, RuntimeError> {
        self.shard_index(shard_id)
            .map(|idx| &self.shards[idx].engine)
            .ok_or(RuntimeError::UnknownShard(shard_id))
    }

    /// A shard's scale engine, mutably (scenario plumbing).
    pub fn shard_engine_mut(&mut self, shard_id: ShardId) -> Result<&mut ScaleEngine, RuntimeError> {
        match self.shard_index(shard_id) {
            Some(idx) => Ok(&mut self.shards[idx].engine),
            None => Err(RuntimeError::UnknownShard(shard_id)),
        }
    }

    /// A shard's lifecycle state.
    pub fn shard_lifecycle(&self, shard_id: ShardId) -> Result<LifecycleState, RuntimeError> {
        self.shard_index(shard_id)
            .map(|idx| self.shards[idx].lifecycle_state)
            .ok_or(RuntimeError::UnknownShard(shard_id))
    }

    fn shard_index(&self, shard_id: ShardId) -> Option<usize> {
        if shard_id == 0 {
            return None;
        }
        self.shards.iter().position(|s| s.shard_id == shard_id)
    }

    fn client_index(&self, client_id: u64) -> Option<usize> {
        self.clients.iter().position(|c| c.client_id == client_id)
    }

    fn owner_get(&self, domain_id: u64) -> ShardId {
        self.owner_index
            .get(&domain_id)
            .map_or(0, |idx| self.owners[*idx].owner_shard_id)
    }

    pub(crate) fn owner_set(&mut self, domain_id: u64, owner_shard_id: ShardId) {
        if domain_id == 0 {
            return;
        }
        if let Some(idx) = self.owner_index.get(&domain_id) {
            self.owners[*idx].owner_shard_id = owner_shard_id;
            return;
        }
        if self.owners.len() >= limits::MAX_DOMAIN_OWNERS {
            return;
        }
        self.owner_index.insert(domain_id, self.owners.len());
        self.owners.push(DomainOwner {
            domain_id,
            owner_shard_id,
        });
    }

    pub(crate) fn rebuild_owner_index(&mut self) {
        self.owner_index.clear();
        for (idx, owner) in self.owners.iter().enumerate() {
            self.owner_index.insert(owner.domain_id, idx);
        }
    }

    // ── Clients ───────────────────────────────────────────────────────

    /// Adds a client pinned to `shard_id`.
    pub fn add_client(
        &mut self,
        client_id: u64,
        shard_id: ShardId,
        policy: Option<ClientPolicy>,
    ) -> Result<(), RuntimeError> {
        if client_id == 0 {
            return Err(RuntimeError::ZeroClientId);
        }
        if self.shard_index(shard_id).is_none() {
            return Err(RuntimeError::UnknownShard(shard_id));
        }
        if self.client_index(client_id).is_some() {
            return Err(RuntimeError::DuplicateClient(client_id));
        }
        if self.clients.len() >= limits::MAX_CLIENTS {
            return Err(RuntimeError::ClientTableFull);
        }
        let mut client = Client::new(
            client_id,
            shard_id,
            policy.unwrap_or(self.config.default_client_policy),
        );
        client.budget_reset(self.now_tick);
        self.clients.push(client);
        Ok(())
    }

    /// Replaces a client's policy and resets its budget.
    pub fn set_client_policy(
        &mut self,
        client_id: u64,
        policy: ClientPolicy,
    ) -> Result<(), RuntimeError> {
        let tick = self.now_tick;
        let idx = self
            .client_index(client_id)
            .ok_or(RuntimeError::UnknownClient(client_id))?;
        let client = &mut self.clients[idx];
        client.policy = policy;
        client.budget_reset(tick);
        Ok(())
    }

    /// A client's current budget counters.
    pub fn client_budget(&self, client_id: u64) -> Result<ClientBudgetState, RuntimeError> {
        self.client_index(client_id)
            .map(|idx| self.clients[idx].budget)
            .ok_or(RuntimeError::UnknownClient(client_id))
    }

    /// Replaces a shard's scale budget policy.
    pub fn set_scale_budget(
        &mut self,
        shard_id: ShardId,
        policy: BudgetPolicy,
    ) -> Result<(), RuntimeError> {
        let tick = self.now_tick;
        let idx = self
            .shard_index(shard_id)
            .ok_or(RuntimeError::UnknownShard(shard_id))?;
        let engine = &mut self.shards[idx].engine;
        engine.set_budget_policy(policy);
        engine.begin_tick(tick);
        Ok(())
    }

    /// A shard's budget snapshot at the current tick.
    pub fn scale_snapshot(&mut self, shard_id: ShardId) -> Result<BudgetSnapshot, RuntimeError> {
        let tick = self.now_tick;
        let idx = self
            .shard_index(shard_id)
            .ok_or(RuntimeError::UnknownShard(shard_id))?;
        let engine = &mut self.shards[idx].engine;
        engine.begin_tick(tick);
        Ok(engine.budget_snapshot())
    }

    /// Transitions a shard's lifecycle state through the state machine.
    pub fn set_shard_state(
        &mut self,
        shard_id: ShardId,
        to_state: LifecycleState,
        reason_code: u32,
    ) -> Result<(), RuntimeError> {
        let tick = self.now_tick;
        let idx = self
            .shard_index(shard_id)
            .ok_or(RuntimeError::UnknownShard(shard_id))?;
        let from = self.shards[idx].lifecycle_state;
        self.lifecycle_log
            .log_transition(shard_id, tick, from, to_state, reason_code)?;
        self.shards[idx].lifecycle_state = to_state;
        Ok(())
    }

    /// Updates a shard's version surface.
    pub fn set_shard_version(
        &mut self,
        shard_id: ShardId,
        version_id: u32,
        capability_mask: u64,
        baseline_hash: u64,
    ) -> Result<(), RuntimeError> {
        let idx = self
            .shard_index(shard_id)
            .ok_or(RuntimeError::UnknownShard(shard_id))?;
        let shard = &mut self.shards[idx];
        shard.version_id = version_id;
        shard.capability_mask = capability_mask;
        shard.baseline_hash = baseline_hash;
        Ok(())
    }

    // ── Intent intake ─────────────────────────────────────────────────

    /// Submits an intent. A zero intent tick maps to "now"; a zero intent
    /// id mints one from the target shard.
    pub fn submit_intent(&mut self, intent: &Intent, payload_bytes: u32) -> Result<(), RuntimeError> {
        if self.intents.len() >= limits::MAX_INTENTS {
            self.intent_overflow += 1;
            return Err(RuntimeError::IntentTableFull);
        }
        let shard_idx = self
            .shard_index(intent.target_shard_id)
            .ok_or(RuntimeError::UnknownShard(intent.target_shard_id))?;
        let mut local = *intent;
        if local.intent_tick == 0 {
            local.intent_tick = self.now_tick;
        }
        local.payload_bytes = payload_bytes;
        if local.intent_id == 0 {
            local.intent_id = self.shards[shard_idx]
                .id_gen
                .next_packed(namespace::INTENT)
                .unwrap_or(u64::from(u32::MAX));
        }
        self.intents.push(local);
        self.intents.sort_by_key(Intent::sort_key);
        Ok(())
    }

    // ── Tick protocol ─────────────────────────────────────────────────

    /// Runs every tick from the current one through `tick` inclusive.
    pub fn tick(&mut self, tick: Tick) -> Result<(), RuntimeError> {
        if tick < self.now_tick {
            return Err(RuntimeError::TickInPast {
                requested: tick,
                current: self.now_tick,
            });
        }
        let mut t = self.now_tick;
        loop {
            self.now_tick = t;
            for client in &mut self.clients {
                client.budget_reset(t);
            }
            for shard in &mut self.shards {
                shard.engine.begin_tick(t);
            }
            self.process_messages();
            self.process_deferred();
            let mut ready: Vec<Intent> = self
                .intents
                .iter()
                .copied()
                .filter(|i| i.intent_tick <= t)
                .collect();
            ready.sort_by_key(Intent::sort_key);
            for intent in &ready {
                let _ = self.process_intent(intent);
            }
            self.intents.retain(|i| i.intent_tick > t);
            self.intents.sort_by_key(Intent::sort_key);
            if t == tick {
                break;
            }
            t += 1;
        }
        Ok(())
    }

    fn process_messages(&mut self) {
        loop {
            let (msg, _skipped) = self.message_log.pop_next_ready(self.now_tick);
            let Some(msg) = msg else { break };
            let _ = self.apply_message(&msg);
        }
    }

    fn process_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.deferred);
        let mut pending = Vec::new();
        for item in items {
            if item.intent.intent_tick > self.now_tick {
                pending.push(item);
                continue;
            }
            if !self.process_intent(&item.intent) {
                pending.push(item);
            }
        }
        pending.sort_by_key(|d| d.intent.sort_key());
        // Deferrals queued while processing are appended after retries.
        self.deferred.splice(0..0, pending);
        self.deferred.sort_by_key(|d| d.intent.sort_key());
    }

    fn queue_deferred(&mut self, intent: &Intent, defer_code: u32) -> bool {
        let mut limit = self.config.deferred_limit as usize;
        if limit == 0 {
            limit = limits::MAX_DEFERRED;
        }
        let limit = limit.min(limits::MAX_DEFERRED);
        if self.deferred.len() >= limit {
            self.deferred_overflow += 1;
            return false;
        }
        let mut local = *intent;
        local.intent_tick = self.now_tick + 1;
        self.deferred.push(DeferredIntent {
            intent: local,
            defer_code,
        });
        self.deferred.sort_by_key(|d| d.intent.sort_key());
        true
    }

    // ── Event emission ────────────────────────────────────────────────

    fn append_event(&mut self, shard_idx: Option<usize>, mut event: RuntimeEvent) {
        if self.events.len() >= limits::MAX_EVENTS {
            self.event_overflow += 1;
            return;
        }
        event.event_id = match shard_idx {
            Some(idx) => self.shards[idx]
                .id_gen
                .next_packed(namespace::EVENT)
                .unwrap_or(0),
            None => self.events.len() as u64 + 1,
        };
        self.events.push(event);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_intent_event(
        &mut self,
        shard_idx: Option<usize>,
        client_idx: Option<usize>,
        intent: &Intent,
        event_kind: RuntimeEventKind,
        result: Option<&OperationResult>,
        scale_event_start: usize,
        refusal_code: RuntimeRefusal,
        detail_code: u32,
    ) {
        let mut ev = RuntimeEvent {
            tick: self.now_tick,
            shard_id: shard_idx.map_or(intent.target_shard_id, |idx| self.shards[idx].shard_id),
            client_id: client_idx.map_or(intent.client_id, |idx| self.clients[idx].client_id),
            domain_id: intent.domain_id,
            capsule_id: intent.capsule_id,
            causal_id: intent.intent_id,
            event_kind: event_kind as u32,
            intent_kind: intent.intent_kind,
            refusal_code,
            detail_code,
            ..RuntimeEvent::default()
        };
        if let Some(result) = result {
            ev.domain_id = result.domain_id;
            ev.capsule_id = result.capsule_id;
        }
        if let Some(idx) = client_idx {
            ev.client_budget = self.clients[idx].budget;
        }
        if let Some(idx) = shard_idx {
            let engine = &self.shards[idx].engine;
            ev.scale_budget = engine.budget_snapshot();
            // Fold the scale events this intent produced into the audit
            // record so refusal/defer causes survive at the runtime level.
            for scale_ev in &engine.event_log().events()[scale_event_start.min(engine.event_log().len())..]
            {
                if scale_ev.budget_kind != 0 {
                    ev.budget_kind = scale_ev.budget_kind;
                    ev.budget_limit = scale_ev.budget_limit;
                    ev.budget_used = scale_ev.budget_used;
                    ev.budget_cost = scale_ev.budget_cost;
                }
                if scale_ev.refusal_code != dominium_scale::RefusalCode::None {
                    ev.refusal_code = RuntimeRefusal::from_scale(scale_ev.refusal_code);
                    ev.detail_code = scale_ev.detail_code;
                }
                if scale_ev.defer_code != DeferCode::None {
                    ev.defer_code = scale_ev.defer_code;
                    ev.detail_code = scale_ev.detail_code;
                }
            }
        }
        self.append_event(shard_idx, ev);
    }

    fn emit_budget_snapshot(&mut self, shard_idx: usize, client_idx: usize) {
        let ev = RuntimeEvent {
            tick: self.now_tick,
            shard_id: self.shards[shard_idx].shard_id,
            client_id: self.clients[client_idx].client_id,
            event_kind: RuntimeEventKind::BudgetSnapshot as u32,
            client_budget: self.clients[client_idx].budget,
            scale_budget: self.shards[shard_idx].engine.budget_snapshot(),
            ..RuntimeEvent::default()
        };
        self.append_event(Some(shard_idx), ev);
    }

    // ── Message handling ──────────────────────────────────────────────

    fn macro_budget_consume(&mut self, shard_idx: usize) -> bool {
        let tick = self.now_tick;
        let engine = &mut self.shards[shard_idx].engine;
        engine.begin_tick(tick);
        let policy = *engine.budget_policy();
        let cost = policy.macro_event_cost_units.max(1);
        let state = engine.budget_state_mut();
        if policy.macro_event_budget_per_tick > 0
            && state.macro_event_used + cost > policy.macro_event_budget_per_tick
        {
            state.refusals.macro_event_budget += 1;
            return false;
        }
        state.macro_event_used += cost;
        true
    }

    fn apply_message(&mut self, msg: &CrossShardMessage) -> bool {
        let Some(shard_idx) = self.shard_index(msg.dest_shard_id) else {
            return false;
        };
        self.shards[shard_idx].engine.begin_tick(self.now_tick);
        let budget_before = self.shards[shard_idx].engine.budget_snapshot();

        let mut ev = RuntimeEvent {
            tick: self.now_tick,
            shard_id: self.shards[shard_idx].shard_id,
            domain_id: msg.domain_id,
            causal_id: msg.message_id,
            event_kind: RuntimeEventKind::MessageApply as u32,
            intent_kind: IntentKind::TransferOwnership as u32,
            ..RuntimeEvent::default()
        };

        if !self.macro_budget_consume(shard_idx) {
            ev.refusal_code = RuntimeRefusal::MacroEventBudget;
            ev.detail_code = runtime_detail::BUDGET_DEFER_LIMIT;
            ev.scale_budget = budget_before;
            self.append_event(Some(shard_idx), ev);
            return false;
        }
        if msg.message_kind == message_kind::OWNERSHIP_TRANSFER {
            self.owner_set(msg.domain_id, msg.dest_shard_id);
            self.message_applied += 1;
            ev.scale_budget = self.shards[shard_idx].engine.budget_snapshot();
            self.append_event(Some(shard_idx), ev);
            return true;
        }
        false
    }

    fn handle_transfer(&mut self, shard_idx: usize, intent: &Intent, domain_id: u64) -> bool {
        let dest_shard_id = intent.payload_u32;
        let Some(dest_idx) = self.shard_index(dest_shard_id) else {
            return false;
        };
        // Cold shards do not accept incoming domains; draining shards may,
        // so rebalances away from a drain can still land.
        if !matches!(
            self.shards[dest_idx].lifecycle_state,
            LifecycleState::Active | LifecycleState::Draining
        ) {
            return false;
        }
        let message_id = self.shards[shard_idx]
            .id_gen
            .next_packed(namespace::MESSAGE)
            .unwrap_or(0);
        let msg = CrossShardMessage {
            message_id,
            idempotency_key: if intent.idempotency_key != 0 {
                intent.idempotency_key
            } else {
                intent.intent_id
            },
            origin_shard_id: self.shards[shard_idx].shard_id,
            dest_shard_id,
            domain_id,
            origin_tick: self.now_tick,
            delivery_tick: self.now_tick,
            causal_key: domain_id,
            order_key: intent.intent_id,
            message_kind: message_kind::OWNERSHIP_TRANSFER,
            sequence: (self.message_sequence & 0xFFFF_FFFF) as u32,
            payload_hash: mix_u64(intent.intent_id, u64::from(dest_shard_id)),
        };
        if !self.message_log.append(&msg) {
            return false;
        }
        self.message_sequence += 1;
        true
    }

    // ── Intent processing ─────────────────────────────────────────────

    fn find_domain(&self, domain_id: u64) -> Option<(usize, u64)> {
        if domain_id == 0 {
            return None;
        }
        for (idx, shard) in self.shards.iter().enumerate() {
            if let Some(slot) = shard.engine.domain(domain_id) {
                return Some((idx, slot.capsule_id));
            }
        }
        None
    }

    fn process_intent(&mut self, intent: &Intent) -> bool {
        let client_idx = self.client_index(intent.client_id);
        let shard_idx = self.shard_index(intent.target_shard_id);
        let (Some(client_idx), Some(shard_idx)) = (client_idx, shard_idx) else {
            self.emit_intent_event(
                shard_idx,
                client_idx,
                intent,
                RuntimeEventKind::IntentRefuse,
                None,
                usize::MAX,
                RuntimeRefusal::InvalidIntent,
                runtime_detail::CLIENT_SHARD,
            );
            return false;
        };
        if self.clients[client_idx].shard_id != self.shards[shard_idx].shard_id {
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentRefuse,
                None,
                usize::MAX,
                RuntimeRefusal::DomainForbidden,
                runtime_detail::CLIENT_SHARD,
            );
            return false;
        }

        // Client rate budget.
        {
            let tick = self.now_tick;
            let client = &mut self.clients[client_idx];
            if client.budget.tick != tick {
                client.budget_reset(tick);
            }
            let over_intents = client.budget.intents_limit > 0
                && client.budget.intents_used + 1 > client.budget.intents_limit;
            let over_bytes = client.budget.bytes_limit > 0
                && client.budget.bytes_used + intent.payload_bytes > client.budget.bytes_limit;
            if over_intents || over_bytes {
                self.emit_intent_event(
                    Some(shard_idx),
                    Some(client_idx),
                    intent,
                    RuntimeEventKind::IntentRefuse,
                    None,
                    usize::MAX,
                    RuntimeRefusal::RateLimit,
                    runtime_detail::NONE,
                );
                return false;
            }
            client.budget.intents_used += 1;
            client.budget.bytes_used += intent.payload_bytes;
        }

        if self.clients[client_idx].policy.inspect_only
            && intent.intent_kind != IntentKind::Observe as u32
        {
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentRefuse,
                None,
                usize::MAX,
                RuntimeRefusal::CapabilityMissing,
                runtime_detail::INSPECT_ONLY,
            );
            return false;
        }

        if intent.idempotency_key != 0 && self.clients[client_idx].idempotent_seen(intent.idempotency_key)
        {
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentAccept,
                None,
                usize::MAX,
                RuntimeRefusal::None,
                runtime_detail::IDEMPOTENT_DUP,
            );
            return true;
        }

        let Some((domain_shard_idx, slot_capsule)) = self.find_domain(intent.domain_id) else {
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentRefuse,
                None,
                usize::MAX,
                RuntimeRefusal::InvalidIntent,
                runtime_detail::DOMAIN_UNKNOWN,
            );
            return false;
        };
        if domain_shard_idx != shard_idx
            || self.owner_get(intent.domain_id) != self.shards[shard_idx].shard_id
        {
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentRefuse,
                None,
                usize::MAX,
                RuntimeRefusal::DomainForbidden,
                runtime_detail::DOMAIN_OWNER,
            );
            return false;
        }

        let tick = self.now_tick;
        self.shards[shard_idx].engine.begin_tick(tick);
        let token = CommitToken::new(tick);
        let scale_event_start = self.shards[shard_idx].engine.event_log().len();

        match IntentKind::from_u32(intent.intent_kind) {
            Some(IntentKind::Observe) => {
                self.emit_intent_event(
                    Some(shard_idx),
                    Some(client_idx),
                    intent,
                    RuntimeEventKind::IntentAccept,
                    None,
                    scale_event_start,
                    RuntimeRefusal::None,
                    runtime_detail::NONE,
                );
                self.emit_budget_snapshot(shard_idx, client_idx);
                self.clients[client_idx].idempotent_record(intent.idempotency_key);
                true
            }
            Some(IntentKind::Collapse) => {
                let reason = if intent.detail_code != 0 {
                    intent.detail_code
                } else {
                    1
                };
                let result = self.shards[shard_idx]
                    .engine
                    .collapse_domain(&token, intent.domain_id, reason)
                    .unwrap_or_default();
                self.settle_scale_result(
                    shard_idx,
                    client_idx,
                    intent,
                    RuntimeEventKind::Collapse,
                    &result,
                    scale_event_start,
                )
            }
            Some(IntentKind::Expand) => {
                let capsule_id = if intent.capsule_id != 0 {
                    intent.capsule_id
                } else {
                    slot_capsule
                };
                if capsule_id == 0 {
                    self.emit_intent_event(
                        Some(shard_idx),
                        Some(client_idx),
                        intent,
                        RuntimeEventKind::IntentRefuse,
                        None,
                        scale_event_start,
                        RuntimeRefusal::InvalidIntent,
                        runtime_detail::DOMAIN_UNKNOWN,
                    );
                    return false;
                }
                let reason = if intent.detail_code != 0 {
                    intent.detail_code
                } else {
                    2
                };
                let result = self.shards[shard_idx].engine.expand_domain(
                    &token,
                    capsule_id,
                    FidelityTier::Micro,
                    reason,
                );
                self.settle_scale_result(
                    shard_idx,
                    client_idx,
                    intent,
                    RuntimeEventKind::Expand,
                    &result,
                    scale_event_start,
                )
            }
            Some(IntentKind::MacroAdvance) => {
                if self.clients[client_idx].policy.capability_mask & 1 == 0 {
                    self.emit_intent_event(
                        Some(shard_idx),
                        Some(client_idx),
                        intent,
                        RuntimeEventKind::IntentRefuse,
                        None,
                        scale_event_start,
                        RuntimeRefusal::CapabilityMissing,
                        runtime_detail::MACRO_UNSUPPORTED,
                    );
                    return false;
                }
                let up_to = if intent.detail_code != 0 {
                    Tick::from(intent.detail_code)
                } else {
                    tick
                };
                let executed = self.shards[shard_idx].engine.macro_advance(&token, up_to, None);
                self.macro_events_executed += u64::from(executed);
                if executed == 0
                    && self.shards[shard_idx]
                        .engine
                        .budget_state()
                        .refusals
                        .macro_event_budget
                        > 0
                {
                    self.emit_intent_event(
                        Some(shard_idx),
                        Some(client_idx),
                        intent,
                        RuntimeEventKind::IntentRefuse,
                        None,
                        scale_event_start,
                        RuntimeRefusal::MacroEventBudget,
                        runtime_detail::NONE,
                    );
                    return false;
                }
                self.emit_intent_event(
                    Some(shard_idx),
                    Some(client_idx),
                    intent,
                    RuntimeEventKind::IntentAccept,
                    None,
                    scale_event_start,
                    RuntimeRefusal::None,
                    executed,
                );
                self.clients[client_idx].idempotent_record(intent.idempotency_key);
                true
            }
            Some(IntentKind::TransferOwnership) => {
                if !self.handle_transfer(shard_idx, intent, intent.domain_id) {
                    self.emit_intent_event(
                        Some(shard_idx),
                        Some(client_idx),
                        intent,
                        RuntimeEventKind::IntentRefuse,
                        None,
                        scale_event_start,
                        RuntimeRefusal::InvalidIntent,
                        runtime_detail::DEST_SHARD,
                    );
                    return false;
                }
                self.emit_intent_event(
                    Some(shard_idx),
                    Some(client_idx),
                    intent,
                    RuntimeEventKind::OwnershipTransfer,
                    None,
                    scale_event_start,
                    RuntimeRefusal::None,
                    intent.payload_u32,
                );
                self.clients[client_idx].idempotent_record(intent.idempotency_key);
                true
            }
            None => {
                self.emit_intent_event(
                    Some(shard_idx),
                    Some(client_idx),
                    intent,
                    RuntimeEventKind::IntentRefuse,
                    None,
                    scale_event_start,
                    RuntimeRefusal::InvalidIntent,
                    runtime_detail::NONE,
                );
                false
            }
        }
    }

    fn settle_scale_result(
        &mut self,
        shard_idx: usize,
        client_idx: usize,
        intent: &Intent,
        success_kind: RuntimeEventKind,
        result: &OperationResult,
        scale_event_start: usize,
    ) -> bool {
        if result.refusal_code != dominium_scale::RefusalCode::None {
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentRefuse,
                Some(result),
                scale_event_start,
                RuntimeRefusal::from_scale(result.refusal_code),
                result.reason_code,
            );
            return false;
        }
        if result.defer_code != DeferCode::None {
            if !self.queue_deferred(intent, result.defer_code as u32) {
                self.emit_intent_event(
                    Some(shard_idx),
                    Some(client_idx),
                    intent,
                    RuntimeEventKind::IntentRefuse,
                    Some(result),
                    scale_event_start,
                    RuntimeRefusal::DeferQueueLimit,
                    runtime_detail::BUDGET_DEFER_LIMIT,
                );
                return false;
            }
            self.emit_intent_event(
                Some(shard_idx),
                Some(client_idx),
                intent,
                RuntimeEventKind::IntentDefer,
                Some(result),
                scale_event_start,
                RuntimeRefusal::None,
                result.defer_code as u32,
            );
            return true;
        }
        self.emit_intent_event(
            Some(shard_idx),
            Some(client_idx),
            intent,
            success_kind,
            Some(result),
            scale_event_start,
            RuntimeRefusal::None,
            result.reason_code,
        );
        self.clients[client_idx].idempotent_record(intent.idempotency_key);
        true
    }

    // ── Join / resync ─────────────────────────────────────────────────

    fn snapshot_for_shard(&self, shard_idx: usize) -> SnapshotFragment {
        let shard = &self.shards[shard_idx];
        let Some(slot) = shard.engine.domains().first() else {
            return SnapshotFragment::default();
        };
        SnapshotFragment {
            shard_id: shard.shard_id,
            domain_id: slot.domain_id,
            domain_kind: slot.kind() as u32,
            tick: shard.engine.now_tick(),
            tier: slot.tier,
            domain_hash: shard.engine.domain_hash(slot.domain_id).unwrap_or(0),
            capsule_id: slot.capsule_id,
        }
    }

    fn capability_hash(client: &Client) -> u64 {
        let mut hash = FNV64_INIT;
        hash = mix_u64(hash, client.policy.capability_mask);
        hash = mix_u64(hash, u64::from(client.policy.inspect_only));
        hash = mix_u64(hash, u64::from(client.policy.intents_per_tick));
        mix_u64(hash, u64::from(client.policy.bytes_per_tick))
    }

    /// Hands a joining client its bootstrap bundle and logs a JOIN event.
    pub fn join(&mut self, client_id: u64) -> Result<JoinBundle, RuntimeError> {
        let client_idx = self
            .client_index(client_id)
            .ok_or(RuntimeError::UnknownClient(client_id))?;
        let shard_id = self.clients[client_idx].shard_id;
        let shard_idx = self
            .shard_index(shard_id)
            .ok_or(RuntimeError::UnknownShard(shard_id))?;
        let bundle = JoinBundle {
            client_id,
            assigned_shard_id: shard_id,
            tick: self.now_tick,
            world_hash: self.runtime_hash(),
            capability_hash: Self::capability_hash(&self.clients[client_idx]),
            snapshot: self.snapshot_for_shard(shard_idx),
            inspect_only: self.clients[client_idx].policy.inspect_only,
            event_tail_index: self.events.len() as u32,
            message_tail_index: (self.message_sequence & 0xFFFF_FFFF) as u32,
        };
        let ev = RuntimeEvent {
            tick: self.now_tick,
            shard_id,
            client_id,
            event_kind: RuntimeEventKind::Join as u32,
            client_budget: self.clients[client_idx].budget,
            scale_budget: self.shards[shard_idx].engine.budget_snapshot(),
            ..RuntimeEvent::default()
        };
        self.append_event(Some(shard_idx), ev);
        Ok(bundle)
    }

    /// Resyncs a client against a shard. Inspect-only clients refuse
    /// unless `allow_partial` is set; the bundle carries the refusal.
    pub fn resync(
        &mut self,
        client_id: u64,
        shard_id: ShardId,
        allow_partial: bool,
    ) -> Result<ResyncBundle, RuntimeError> {
        let client_idx = self
            .client_index(client_id)
            .ok_or(RuntimeError::UnknownClient(client_id))?;
        let shard_idx = self
            .shard_index(shard_id)
            .ok_or(RuntimeError::UnknownShard(shard_id))?;
        let refusal = if !allow_partial && self.clients[client_idx].policy.inspect_only {
            RuntimeRefusal::CapabilityMissing
        } else {
            RuntimeRefusal::None
        };
        let bundle = ResyncBundle {
            client_id,
            shard_id,
            tick: self.now_tick,
            world_hash: self.runtime_hash(),
            snapshot: self.snapshot_for_shard(shard_idx),
            event_tail_index: self.events.len() as u32,
            message_tail_index: (self.message_sequence & 0xFFFF_FFFF) as u32,
            refusal_code: refusal,
        };
        let ev = RuntimeEvent {
            tick: self.now_tick,
            shard_id,
            client_id,
            event_kind: RuntimeEventKind::Resync as u32,
            refusal_code: refusal,
            client_budget: self.clients[client_idx].budget,
            scale_budget: self.shards[shard_idx].engine.budget_snapshot(),
            ..RuntimeEvent::default()
        };
        self.append_event(Some(shard_idx), ev);
        Ok(bundle)
    }

    // ── Hashing ───────────────────────────────────────────────────────

    /// The runtime hash: the single cross-implementation invariant.
    ///
    /// Folds the tick, table counts and overflows, message counters, the
    /// cross-shard log hash, the lifecycle log hash, the owner table,
    /// every shard's scale-event-log hash and domain hashes, and every
    /// audit event's fields, in fixed order.
    #[must_use]
    pub fn runtime_hash(&self) -> u64 {
        let mut hash = FNV64_INIT;
        hash = mix_u64(hash, self.now_tick as u64);
        hash = mix_u64(hash, u64::from(self.shard_count()));
        hash = mix_u64(hash, self.clients.len() as u64);
        hash = mix_u64(hash, self.intents.len() as u64);
        hash = mix_u64(hash, self.deferred.len() as u64);
        hash = mix_u64(hash, self.owners.len() as u64);
        hash = mix_u64(hash, self.events.len() as u64);
        hash = mix_u64(hash, u64::from(self.event_overflow));
        hash = mix_u64(hash, self.message_sequence);
        hash = mix_u64(hash, self.message_applied);
        hash = mix_u64(hash, self.message_log.hash());
        hash = mix_u64(hash, self.lifecycle_log.hash());
        for owner in &self.owners {
            hash = mix_u64(hash, owner.domain_id);
            hash = mix_u64(hash, u64::from(owner.owner_shard_id));
        }
        for shard in &self.shards {
            hash = mix_u64(hash, u64::from(shard.shard_id));
            hash = mix_u64(hash, shard.engine.event_log().hash());
            for slot in shard.engine.domains() {
                hash = mix_u64(
                    hash,
                    dominium_scale::domain_hash(slot, self.now_tick, shard.engine.worker_count()),
                );
            }
        }
        for ev in &self.events {
            hash = mix_u64(hash, ev.event_id);
            hash = mix_u64(hash, ev.tick as u64);
            hash = mix_u64(hash, u64::from(ev.shard_id));
            hash = mix_u64(hash, ev.client_id);
            hash = mix_u64(hash, ev.domain_id);
            hash = mix_u64(hash, ev.capsule_id);
            hash = mix_u64(hash, u64::from(ev.event_kind));
            hash = mix_u64(hash, u64::from(ev.intent_kind));
            hash = mix_u64(hash, u64::from(ev.refusal_code as u32));
            hash = mix_u64(hash, u64::from(ev.defer_code as u32));
            hash = mix_u64(hash, u64::from(ev.budget_kind));
            hash = mix_u64(hash, u64::from(ev.budget_limit));
            hash = mix_u64(hash, u64::from(ev.budget_used));
            hash = mix_u64(hash, u64::from(ev.budget_cost));
            hash = mix_u64(hash, u64::from(ev.detail_code));
            hash = mix_u64(hash, u64::from(ev.payload_u32));
        }
        hash
    }

    /// Domain ids seeded on a shard, in registration (sorted) order.
    pub fn shard_domain_ids(&self, shard_id: ShardId) -> Result<Vec<u64>, RuntimeError> {
        self.shard_engine(shard_id)
            .map(|engine| engine.domains().iter().map(|d| d.domain_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_shards_are_deterministic() {
        let a = Runtime::new(RuntimeConfig {
            shard_count: 2,
            ..RuntimeConfig::default()
        });
        let b = Runtime::new(RuntimeConfig {
            shard_count: 2,
            ..RuntimeConfig::default()
        });
        assert_eq!(a.runtime_hash(), b.runtime_hash());
        assert_eq!(a.shard_domain_ids(1).expect("ids").len(), 3);
        assert_ne!(
            a.shard_domain_ids(1).expect("ids"),
            a.shard_domain_ids(2).expect("ids")
        );
    }

    #[test]
    fn worker_count_does_not_change_the_hash() {
        let mk = |workers: u32| {
            Runtime::new(RuntimeConfig {
                shard_count: 2,
                worker_count: workers,
                ..RuntimeConfig::default()
            })
        };
        assert_eq!(mk(1).runtime_hash(), mk(16).runtime_hash());
    }

    #[test]
    fn client_admission_is_bounded() {
        let mut runtime = Runtime::new(RuntimeConfig::default());
        assert_eq!(
            runtime.add_client(0, 1, None),
            Err(RuntimeError::ZeroClientId)
        );
        assert_eq!(
            runtime.add_client(1, 9, None),
            Err(RuntimeError::UnknownShard(9))
        );
        runtime.add_client(1, 1, None).expect("add");
        assert_eq!(
            runtime.add_client(1, 1, None),
            Err(RuntimeError::DuplicateClient(1))
        );
    }

    #[test]
    fn observe_emits_accept_and_snapshot() {
        let mut runtime = Runtime::new(RuntimeConfig::default());
        runtime.add_client(1, 1, None).expect("client");
        let domain = runtime.shard_domain_ids(1).expect("ids")[0];
        runtime
            .submit_intent(
                &Intent {
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: domain,
                    intent_kind: IntentKind::Observe as u32,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
        runtime.tick(0).expect("tick");
        let kinds: Vec<u32> = runtime.events().iter().map(|e| e.event_kind).collect();
        assert!(kinds.contains(&(RuntimeEventKind::IntentAccept as u32)));
        assert!(kinds.contains(&(RuntimeEventKind::BudgetSnapshot as u32)));
    }

    #[test]
    fn collapse_intent_reaches_the_engine() {
        let mut runtime = Runtime::new(RuntimeConfig::default());
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
        runtime.tick(0).expect("tick");
        let engine = runtime.shard_engine(1).expect("engine");
        assert_eq!(
            engine.domain(domain).expect("slot").tier,
            FidelityTier::Latent
        );
        assert!(runtime
            .events()
            .iter()
            .any(|e| e.event_kind == RuntimeEventKind::Collapse as u32));
    }

    #[test]
    fn unknown_domain_refuses() {
        let mut runtime = Runtime::new(RuntimeConfig::default());
        runtime.add_client(1, 1, None).expect("client");
        runtime
            .submit_intent(
                &Intent {
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: 0xdead,
                    intent_kind: IntentKind::Collapse as u32,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
        runtime.tick(0).expect("tick");
        let refusal = runtime
            .events()
            .iter()
            .find(|e| e.event_kind == RuntimeEventKind::IntentRefuse as u32)
            .expect("refusal");
        assert_eq!(refusal.detail_code, runtime_detail::DOMAIN_UNKNOWN);
    }

    #[test]
    fn transfer_to_frozen_shard_refuses() {
        let mut runtime = Runtime::new(RuntimeConfig {
            shard_count: 2,
            ..RuntimeConfig::default()
        });
        runtime.add_client(1, 1, None).expect("client");
        runtime
            .set_shard_state(2, LifecycleState::Frozen, 1)
            .expect("freeze");
        let domain = runtime.shard_domain_ids(1).expect("ids")[0];
        runtime
            .submit_intent(
                &Intent {
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: domain,
                    intent_kind: IntentKind::TransferOwnership as u32,
                    payload_u32: 2,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
        runtime.tick(0).expect("tick");
        let refusal = runtime
            .events()
            .iter()
            .find(|e| e.event_kind == RuntimeEventKind::IntentRefuse as u32)
            .expect("refusal");
        assert_eq!(refusal.detail_code, runtime_detail::DEST_SHARD);
        assert_eq!(runtime.message_sequence(), 0);
    }

    #[test]
    fn transfer_applies_through_the_message_log() {
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
                    intent_kind: IntentKind::TransferOwnership as u32,
                    payload_u32: 2,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
        runtime.tick(1).expect("tick");
        assert_eq!(runtime.message_applied(), 1);
        assert_eq!(
            runtime
                .owners()
                .iter()
                .find(|o| o.domain_id == domain)
                .expect("owner")
                .owner_shard_id,
            2
        );
    }

    #[test]
    fn join_and_resync_bundles() {
        let mut runtime = Runtime::new(RuntimeConfig::default());
        runtime.add_client(1, 1, None).expect("client");
        let bundle = runtime.join(1).expect("join");
        assert_eq!(bundle.assigned_shard_id, 1);
        assert_ne!(bundle.world_hash, 0);
        assert_ne!(bundle.snapshot.domain_id, 0);

        runtime
            .set_client_policy(
                1,
                ClientPolicy {
                    inspect_only: true,
                    ..ClientPolicy::default()
                },
            )
            .expect("policy");
        let denied = runtime.resync(1, 1, false).expect("resync");
        assert_eq!(denied.refusal_code, RuntimeRefusal::CapabilityMissing);
        let allowed = runtime.resync(1, 1, true).expect("resync");
        assert_eq!(allowed.refusal_code, RuntimeRefusal::None);
    }
}
