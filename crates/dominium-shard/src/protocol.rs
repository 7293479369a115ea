// SPDX-License-Identifier: Apache-2.0
//! Runtime protocol surfaces: intents, audit events, refusal codes.
//!
//! Every enum and payload shape here is stable and replayable; the audit
//! event stream participates in the runtime hash.

use dominium_scale::{BudgetSnapshot, DeferCode, FidelityTier, Tick};

/// Shard identifier; 0 is reserved for "no shard".
pub type ShardId = u32;

/// Kind of a client intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum IntentKind {
    /// Read-only observation; emits a budget snapshot.
    Observe = 1,
    /// Collapse a domain.
    Collapse = 2,
    /// Expand a capsule.
    Expand = 3,
    /// Advance macro events.
    MacroAdvance = 4,
    /// Transfer domain ownership to another shard.
    TransferOwnership = 5,
}

impl IntentKind {
    /// Decodes a wire value; unknown values return `None`.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Observe),
            2 => Some(Self::Collapse),
            3 => Some(Self::Expand),
            4 => Some(Self::MacroAdvance),
            5 => Some(Self::TransferOwnership),
            _ => None,
        }
    }
}

/// Kind of a runtime audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RuntimeEventKind {
    /// Intent accepted.
    IntentAccept = 1,
    /// Intent refused.
    IntentRefuse = 2,
    /// Intent deferred to a later tick.
    IntentDefer = 3,
    /// A collapse committed.
    Collapse = 4,
    /// An expansion committed.
    Expand = 5,
    /// An ownership-transfer message was minted.
    OwnershipTransfer = 6,
    /// A cross-shard message was applied.
    MessageApply = 7,
    /// A client joined.
    Join = 8,
    /// A client resynced.
    Resync = 9,
    /// A budget snapshot was emitted.
    BudgetSnapshot = 10,
}

/// Runtime refusal codes. The 7xx range mirrors the scale engine's
/// budget-kind taxonomy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RuntimeRefusal {
    /// No refusal.
    #[default]
    None = 0,
    /// Malformed or inapplicable intent.
    InvalidIntent = 1,
    /// Forbidden by law/policy.
    LawForbidden = 2,
    /// Caller lacks a required capability.
    CapabilityMissing = 3,
    /// Domain state forbids the operation.
    DomainForbidden = 4,
    /// Integrity check failed (hash or schema mismatch).
    IntegrityViolation = 5,
    /// Client rate limit hit.
    RateLimit = 6,
    /// Generic budget exhaustion.
    BudgetExceeded = 7,
    /// Active-domain cap reached.
    ActiveDomainLimit = 701,
    /// Refinement budget exhausted.
    RefinementBudget = 702,
    /// Macro-event budget exhausted.
    MacroEventBudget = 703,
    /// Agent-planning budget exhausted.
    AgentPlanningBudget = 704,
    /// Snapshot budget exhausted.
    SnapshotBudget = 705,
    /// Collapse budget exhausted.
    CollapseBudget = 706,
    /// Deferred queue full.
    DeferQueueLimit = 707,
}

impl RuntimeRefusal {
    /// Translates a scale-engine refusal code.
    #[must_use]
    pub fn from_scale(code: dominium_scale::RefusalCode) -> Self {
        use dominium_scale::RefusalCode as S;
        match code {
            S::None => Self::None,
            S::InvalidIntent => Self::InvalidIntent,
            S::CapabilityMissing => Self::CapabilityMissing,
            S::DomainForbidden => Self::DomainForbidden,
            S::BudgetExceeded => Self::BudgetExceeded,
            S::ActiveDomainLimit => Self::ActiveDomainLimit,
            S::RefinementBudget => Self::RefinementBudget,
            S::MacroEventBudget => Self::MacroEventBudget,
            S::AgentPlanningBudget => Self::AgentPlanningBudget,
            S::SnapshotBudget => Self::SnapshotBudget,
            S::CollapseBudget => Self::CollapseBudget,
            S::DeferQueueLimit => Self::DeferQueueLimit,
        }
    }

    /// Short stable name, used by the scenario CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "REFUSE_NONE",
            Self::InvalidIntent => "REFUSE_INVALID_INTENT",
            Self::LawForbidden => "REFUSE_LAW_FORBIDDEN",
            Self::CapabilityMissing => "REFUSE_CAPABILITY_MISSING",
            Self::DomainForbidden => "REFUSE_DOMAIN_FORBIDDEN",
            Self::IntegrityViolation => "REFUSE_INTEGRITY_VIOLATION",
            Self::RateLimit => "REFUSE_RATE_LIMIT",
            Self::BudgetExceeded => "REFUSE_BUDGET_EXCEEDED",
            Self::ActiveDomainLimit => "REFUSE_ACTIVE_DOMAIN_LIMIT",
            Self::RefinementBudget => "REFUSE_REFINEMENT_BUDGET",
            Self::MacroEventBudget => "REFUSE_MACRO_EVENT_BUDGET",
            Self::AgentPlanningBudget => "REFUSE_AGENT_PLANNING_BUDGET",
            Self::SnapshotBudget => "REFUSE_SNAPSHOT_BUDGET",
            Self::CollapseBudget => "REFUSE_COLLAPSE_BUDGET",
            Self::DeferQueueLimit => "REFUSE_DEFER_QUEUE_LIMIT",
        }
    }
}

/// Detail codes on runtime events.
pub mod runtime_detail {
    /// No detail.
    pub const NONE: u32 = 0;
    /// Client or shard lookup failed, or they disagree.
    pub const CLIENT_SHARD: u32 = 1;
    /// Inspect-only client attempted a mutating intent.
    pub const INSPECT_ONLY: u32 = 2;
    /// Domain is owned by a different shard.
    pub const DOMAIN_OWNER: u32 = 3;
    /// Domain lookup failed.
    pub const DOMAIN_UNKNOWN: u32 = 4;
    /// Transfer destination shard invalid or not accepting.
    pub const DEST_SHARD: u32 = 5;
    /// Runtime deferred queue full.
    pub const BUDGET_DEFER_LIMIT: u32 = 6;
    /// Intent dropped as an idempotent duplicate.
    pub const IDEMPOTENT_DUP: u32 = 7;
    /// Macro advance not permitted for this client.
    pub const MACRO_UNSUPPORTED: u32 = 8;
}

/// Per-client rate and capability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPolicy {
    /// Intents admitted per tick; 0 means unlimited.
    pub intents_per_tick: u32,
    /// Payload bytes admitted per tick; 0 means unlimited.
    pub bytes_per_tick: u32,
    /// When set, only OBSERVE intents are admitted.
    pub inspect_only: bool,
    /// Capability bits; bit 0 gates MACRO_ADVANCE.
    pub capability_mask: u64,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            intents_per_tick: 16,
            bytes_per_tick: 1024,
            inspect_only: false,
            capability_mask: 1,
        }
    }
}

/// Per-client per-tick budget counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientBudgetState {
    /// Tick these counters belong to.
    pub tick: Tick,
    /// Intent admission limit.
    pub intents_limit: u32,
    /// Intents admitted this tick.
    pub intents_used: u32,
    /// Byte admission limit.
    pub bytes_limit: u32,
    /// Bytes admitted this tick.
    pub bytes_used: u32,
}

/// One client intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Intent {
    /// Intent id; 0 lets the runtime mint one at submission.
    pub intent_id: u64,
    /// Submitting client.
    pub client_id: u64,
    /// Shard the intent targets.
    pub target_shard_id: ShardId,
    /// Domain the intent concerns.
    pub domain_id: u64,
    /// Capsule involved (EXPAND), 0 to use the domain's latest.
    pub capsule_id: u64,
    /// Tick the intent becomes eligible; 0 maps to "now" at submission.
    pub intent_tick: Tick,
    /// Client-side tick reference, carried verbatim.
    pub client_tick_ref: Tick,
    /// Idempotency key; duplicates are accepted without re-execution.
    pub idempotency_key: u64,
    /// Intent kind (`IntentKind as u32`).
    pub intent_kind: u32,
    /// Declared cost units.
    pub intent_cost_units: u32,
    /// Kind-specific detail (reason code or advance horizon).
    pub detail_code: u32,
    /// Kind-specific word (transfer destination shard).
    pub payload_u32: u32,
    /// Declared payload size in bytes.
    pub payload_bytes: u32,
}

impl Intent {
    /// Total ordering for the per-tick drain:
    /// `(intent_tick, target_shard, domain, client, intent_id)`.
    #[must_use]
    pub fn sort_key(&self) -> (Tick, ShardId, u64, u64, u64) {
        (
            self.intent_tick,
            self.target_shard_id,
            self.domain_id,
            self.client_id,
            self.intent_id,
        )
    }
}

/// A view of one shard's headline domain for join/resync bundles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotFragment {
    /// Shard the fragment describes.
    pub shard_id: ShardId,
    /// Domain described.
    pub domain_id: u64,
    /// Raw domain kind tag.
    pub domain_kind: u32,
    /// Tick of the fragment.
    pub tick: Tick,
    /// Current fidelity tier.
    pub tier: FidelityTier,
    /// Combined domain hash.
    pub domain_hash: u64,
    /// Latest capsule id.
    pub capsule_id: u64,
}

/// Bundle handed to a joining client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinBundle {
    /// Joining client.
    pub client_id: u64,
    /// Shard the client is assigned to.
    pub assigned_shard_id: ShardId,
    /// Tick of the join.
    pub tick: Tick,
    /// Runtime hash at the join.
    pub world_hash: u64,
    /// Hash of the client's capability policy.
    pub capability_hash: u64,
    /// Headline domain snapshot.
    pub snapshot: SnapshotFragment,
    /// Whether the client is inspect-only.
    pub inspect_only: bool,
    /// Audit-event index the client should tail from.
    pub event_tail_index: u32,
    /// Message-sequence index the client should tail from.
    pub message_tail_index: u32,
}

/// Bundle handed to a resyncing client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncBundle {
    /// Resyncing client.
    pub client_id: u64,
    /// Shard resynced against.
    pub shard_id: ShardId,
    /// Tick of the resync.
    pub tick: Tick,
    /// Runtime hash at the resync.
    pub world_hash: u64,
    /// Headline domain snapshot.
    pub snapshot: SnapshotFragment,
    /// Audit-event index the client should tail from.
    pub event_tail_index: u32,
    /// Message-sequence index the client should tail from.
    pub message_tail_index: u32,
    /// Refusal code when the resync was denied.
    pub refusal_code: RuntimeRefusal,
}

/// One audit event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Event id minted by the shard's id generator.
    pub event_id: u64,
    /// Tick the event landed.
    pub tick: Tick,
    /// Shard attributed.
    pub shard_id: ShardId,
    /// Client attributed, 0 when none.
    pub client_id: u64,
    /// Domain concerned, 0 when none.
    pub domain_id: u64,
    /// Capsule concerned, 0 when none.
    pub capsule_id: u64,
    /// Causal id (intent id or message id).
    pub causal_id: u64,
    /// Event kind (`RuntimeEventKind as u32`).
    pub event_kind: u32,
    /// Intent kind involved (`IntentKind as u32`), 0 when none.
    pub intent_kind: u32,
    /// Refusal code.
    pub refusal_code: RuntimeRefusal,
    /// Scale-side defer code.
    pub defer_code: DeferCode,
    /// Budget kind involved (`BudgetKind as u32`).
    pub budget_kind: u32,
    /// Budget limit at emission.
    pub budget_limit: u32,
    /// Budget used at emission.
    pub budget_used: u32,
    /// Budget cost of the attempted admission.
    pub budget_cost: u32,
    /// Detail code.
    pub detail_code: u32,
    /// Kind-specific word.
    pub payload_u32: u32,
    /// Client budget counters at emission.
    pub client_budget: ClientBudgetState,
    /// Scale budget snapshot at emission.
    pub scale_budget: BudgetSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_sort_key_orders_by_tick_first() {
        let early = Intent {
            intent_tick: 1,
            target_shard_id: 9,
            ..Intent::default()
        };
        let late = Intent {
            intent_tick: 2,
            target_shard_id: 1,
            ..Intent::default()
        };
        assert!(early.sort_key() < late.sort_key());
    }

    #[test]
    fn scale_refusals_translate_verbatim() {
        use dominium_scale::RefusalCode;
        assert_eq!(
            RuntimeRefusal::from_scale(RefusalCode::CollapseBudget),
            RuntimeRefusal::CollapseBudget
        );
        assert_eq!(
            RuntimeRefusal::from_scale(RefusalCode::None),
            RuntimeRefusal::None
        );
    }

    #[test]
    fn refusal_names_match_wire_values() {
        assert_eq!(RuntimeRefusal::RateLimit as u32, 6);
        assert_eq!(RuntimeRefusal::DeferQueueLimit as u32, 707);
        assert_eq!(RuntimeRefusal::RateLimit.as_str(), "REFUSE_RATE_LIMIT");
    }
}
