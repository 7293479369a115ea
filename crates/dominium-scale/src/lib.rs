// SPDX-License-Identifier: Apache-2.0
//! dominium-scale: deterministic collapse/expand engine for scale domains.
//!
//! A domain (resources, a transport network, an agent population) lives at
//! one of three fidelity tiers. The engine collapses expanded domains into
//! binary capsules, advances macro-scale events against latent capsules,
//! and expands capsules back into domains whose recomputed invariant and
//! statistic hashes must match the recorded ones. Everything is
//! single-threaded and replayable: identical inputs produce identical
//! stores, logs, and hashes for any declared worker count.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cast_possible_truncation,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

mod budget;
mod capsule_store;
mod codec;
mod domain;
mod engine;
mod event;
mod event_heap;
/// FNV-1a hashing and identifier derivation (wire contract).
pub mod hashing;
mod interest;
mod rng;
mod schedule_store;
mod stats;
mod wire;

pub use budget::{
    budget_kind_from_detail, refusal_for_budget, BudgetKind, BudgetPolicy, BudgetSnapshot,
    BudgetState, DeferredKind, DeferredOp, RefusalCounters, DEFER_QUEUE_CAP,
};
pub use capsule_store::{CapsuleRecord, CapsuleStore, StoreError, CAPSULE_STORE_VERSION};
pub use codec::{
    parse_capsule, serialize_capsule, serialize_from_data, statistic_ids, summarize_capsule,
    CapsuleData, CapsuleSummary, CodecError, SerializedCapsule, CAPSULE_SCHEMA, CAPSULE_VERSION,
    EXT_COMPACTED_THROUGH, EXT_MACRO_EVENTS, EXT_MACRO_INTERVAL, EXT_MACRO_LAST_TICK,
    EXT_NARRATIVE_EVENTS, EXT_SCALE1_KEY, EXT_SCALE1_VALUE, INVARIANT_IDS, STAT_IDS_AGENTS,
    STAT_IDS_NETWORK, STAT_IDS_RESOURCES,
};
pub use domain::{
    sort_agents, sort_edges, sort_nodes, sort_resources, AgentEntry, DomainKind, DomainPayload,
    DomainSlot, FidelityTier, NetworkEdge, NetworkNode, ResourceEntry, Tick,
};
pub use engine::{CommitToken, EngineError, MacroPolicy, OperationResult, ScaleEngine};
pub use event::{detail, DeferCode, RefusalCode, ScaleEvent, ScaleEventKind, ScaleEventLog};
pub use event_heap::{MacroEventEntry, MacroEventHeap, EVENT_FLAG_NARRATIVE, EVENT_HEAP_VERSION};
pub use interest::{
    apply_interest_set, InterestPolicy, InterestSample, InterestSet, InterestState,
    InterestTransition, RelevanceState, STRENGTH_HIGH, STRENGTH_LOW, STRENGTH_MED,
};
pub use rng::{
    rng_state_from_seed, RngStream, EXT_RNG_AGENTS_RECONSTRUCT, STREAM_AGENTS_RECONSTRUCT,
};
pub use schedule_store::{MacroScheduleStore, ScheduleEntry, SCHEDULE_STORE_VERSION};
pub use stats::{
    agent_buckets, agent_invariant_hash, agent_statistic_hash, domain_hash, network_invariant_hash,
    network_statistic_hash, resource_buckets, resource_invariant_hash, resource_statistic_hash,
    wear_distribution, wear_within_tolerance, PlanningBucket, ResourceBuckets, RoleTraitBucket,
    WearDistribution,
};
pub use wire::{Reader, WireError, Writer};
