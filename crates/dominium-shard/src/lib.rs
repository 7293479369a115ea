// SPDX-License-Identifier: Apache-2.0
//! dominium-shard: the authoritative multi-shard runtime.
//!
//! Hosts up to four shards, each wrapping a `dominium-scale` engine with
//! three seeded domains. Provides intent admission with per-client rate
//! budgets, a strict per-tick drain order, an ordered idempotent
//! cross-shard message log, a shard lifecycle state machine, and ring-
//! buffered checkpoint capture/recovery. The runtime hash is the single
//! cross-implementation invariant: identical intent streams produce
//! identical hashes regardless of submission order or worker count.
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

mod checkpoint;
mod cross_shard;
mod global_id;
mod lifecycle;
mod protocol;
mod runtime;

pub use checkpoint::{
    capture, recover, CheckpointManifest, CheckpointPolicy, CheckpointRecord, CheckpointStore,
    RecoverError, ShardCheckpoint, TriggerReason, CHECKPOINT_MAX_RECORDS,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use cross_shard::{
    message_kind, CrossShardLog, CrossShardMessage, IdempotencyEntry,
};
pub use global_id::{namespace, GlobalId, GlobalIdGen, NAMESPACE_CAP};
pub use lifecycle::{
    transition_allowed, LifecycleEntry, LifecycleLog, LifecycleState, TransitionError,
};
pub use protocol::{
    runtime_detail, ClientBudgetState, ClientPolicy, Intent, IntentKind, JoinBundle, ResyncBundle,
    RuntimeEvent, RuntimeEventKind, RuntimeRefusal, ShardId, SnapshotFragment,
};
pub use runtime::{
    limits, DeferredIntent, DomainOwner, Runtime, RuntimeConfig, RuntimeError,
};
