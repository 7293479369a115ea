// SPDX-License-Identifier: Apache-2.0
//! Scale events, refusal/defer codes, and the fixed-capacity event log.
//!
//! The event log is the engine's observability surface: every admission
//! decision lands here, and the log's hash participates in the runtime
//! hash, so event order and content are part of the determinism contract.

use crate::domain::Tick;
use crate::hashing::{mix_u64, FNV64_INIT};

/// Kind of a scale event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ScaleEventKind {
    /// A domain collapsed to a capsule.
    Collapse = 1,
    /// A capsule expanded back into a domain.
    Expand = 2,
    /// An admission was refused.
    Refusal = 3,
    /// An admission was deferred to a later tick.
    Defer = 4,
    /// A macro event was scheduled.
    MacroSchedule = 5,
    /// A macro event executed against a latent capsule.
    MacroExecute = 6,
    /// A domain's macro backlog was compacted.
    MacroCompact = 7,
}

/// Refusal codes. Values 701..=707 select the budget kind that refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RefusalCode {
    /// No refusal.
    #[default]
    None = 0,
    /// Malformed or inapplicable request.
    InvalidIntent = 1,
    /// Request requires a capability the caller lacks.
    CapabilityMissing = 3,
    /// The target domain forbids the operation in its current state.
    DomainForbidden = 4,
    /// Generic budget exhaustion.
    BudgetExceeded = 7,
    /// Active-domain (tier) cap reached.
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

impl RefusalCode {
    /// Short stable name, used by the scenario CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "REFUSE_NONE",
            Self::InvalidIntent => "REFUSE_INVALID_INTENT",
            Self::CapabilityMissing => "REFUSE_CAPABILITY_MISSING",
            Self::DomainForbidden => "REFUSE_DOMAIN_FORBIDDEN",
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

/// Deferral codes: which operation was pushed to a later tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum DeferCode {
    /// No deferral.
    #[default]
    None = 0,
    /// Collapse deferred.
    Collapse = 1,
    /// Expansion deferred.
    Expand = 2,
    /// Macro event deferred.
    MacroEvent = 3,
    /// Compaction deferred.
    Compaction = 4,
}

impl DeferCode {
    /// Short stable name, used by the scenario CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "DEFER_NONE",
            Self::Collapse => "DEFER_COLLAPSE",
            Self::Expand => "DEFER_EXPANSION",
            Self::MacroEvent => "DEFER_MACRO_EVENT",
            Self::Compaction => "DEFER_COMPACTION",
        }
    }
}

/// Detail codes attached to refusal/defer events. These narrow a refusal
/// code down to the concrete admission rule that fired.
pub mod detail {
    /// No detail.
    pub const NONE: u32 = 0;
    /// Commit token tick/nonce mismatch.
    pub const COMMIT_TICK: u32 = 1;
    /// Domain kind not supported by the engine.
    pub const DOMAIN_UNSUPPORTED: u32 = 2;
    /// Interest state pins the domain at tier 2.
    pub const INTEREST_TIER2: u32 = 3;
    /// Collapse budget exhausted.
    pub const BUDGET_COLLAPSE: u32 = 4;
    /// Expand budget exhausted.
    pub const BUDGET_EXPAND: u32 = 5;
    /// Tier-1 cap reached.
    pub const TIER_CAP: u32 = 6;
    /// Minimum dwell time not yet elapsed.
    pub const DWELL_TICKS: u32 = 7;
    /// Capsule missing or unparseable.
    pub const CAPSULE_PARSE: u32 = 8;
    /// Recomputed hash disagrees with the capsule.
    pub const INVARIANT_MISMATCH: u32 = 9;
    /// Reconstruction exceeds slot capacity.
    pub const CAPACITY: u32 = 10;
    /// Macro event queue at its configured limit.
    pub const MACRO_QUEUE_LIMIT: u32 = 11;
    /// Macro-event budget exhausted.
    pub const BUDGET_MACRO_EVENT: u32 = 12;
    /// Compaction budget exhausted.
    pub const BUDGET_COMPACTION: u32 = 13;
    /// Macro schedule store rejected an update.
    pub const MACRO_SCHEDULE: u32 = 14;
    /// Macro event failed to execute.
    pub const MACRO_EVENT: u32 = 15;
    /// Macro compaction failed.
    pub const MACRO_COMPACTION: u32 = 16;
    /// Tier-2 active-domain cap reached.
    pub const ACTIVE_DOMAIN_LIMIT: u32 = 17;
    /// Refinement budget exhausted.
    pub const BUDGET_REFINEMENT: u32 = 18;
    /// Agent-planning budget exhausted.
    pub const BUDGET_PLANNING: u32 = 19;
    /// Snapshot budget exhausted.
    pub const BUDGET_SNAPSHOT: u32 = 20;
    /// Deferred queue full.
    pub const DEFER_QUEUE_LIMIT: u32 = 21;
}

/// One scale event.
///
/// `domain_kind` is the raw kind tag and may be 0 when the domain was
/// unknown at emission time (e.g. a refusal before lookup succeeded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleEvent {
    /// Event kind discriminant (`ScaleEventKind as u32`).
    pub kind: u32,
    /// Domain the event concerns, 0 when unknown.
    pub domain_id: u64,
    /// Raw domain kind tag, 0 when unknown.
    pub domain_kind: u32,
    /// Capsule involved, 0 when none.
    pub capsule_id: u64,
    /// Caller-supplied reason code.
    pub reason_code: u32,
    /// Refusal code, `None` for non-refusals.
    pub refusal_code: RefusalCode,
    /// Defer code, `None` for non-deferrals.
    pub defer_code: DeferCode,
    /// Detail code narrowing the rule that fired.
    pub detail_code: u32,
    /// Seed value relevant to the event (capsule seed or order-key low word).
    pub seed_value: u32,
    /// Budget kind involved (`BudgetKind as u32`), 0 for none.
    pub budget_kind: u32,
    /// Budget limit at emission.
    pub budget_limit: u32,
    /// Budget used at emission.
    pub budget_used: u32,
    /// Cost of the admission that was attempted.
    pub budget_cost: u32,
    /// Deferred-queue depth at emission.
    pub budget_queue: u32,
    /// Deferred-queue overflow count at emission.
    pub budget_overflow: u32,
    /// Tick the event is attributed to.
    pub tick: Tick,
}

/// Fixed-capacity scale event log with an overflow counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleEventLog {
    events: Vec<ScaleEvent>,
    capacity: usize,
    overflow: u32,
}

impl ScaleEventLog {
    /// Creates an empty log holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity.min(4096)),
            capacity,
            overflow: 0,
        }
    }

    /// Appends an event; a full log counts the drop instead.
    pub fn emit(&mut self, event: ScaleEvent) {
        if self.capacity == 0 || self.events.len() >= self.capacity {
            self.overflow += 1;
            return;
        }
        self.events.push(event);
    }

    /// Recorded events in emission order.
    #[must_use]
    pub fn events(&self) -> &[ScaleEvent] {
        &self.events
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events dropped on overflow.
    #[must_use]
    pub fn overflow(&self) -> u32 {
        self.overflow
    }

    /// Drops all events and resets the overflow counter.
    pub fn clear(&mut self) {
        self.events.clear();
        self.overflow = 0;
    }

    /// Restores the log from a checkpoint copy.
    pub fn restore(&mut self, events: &[ScaleEvent], overflow: u32) {
        self.events.clear();
        self.events.extend_from_slice(events);
        self.overflow = overflow;
    }

    /// Deterministic hash over count, overflow, and every event field.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hash = FNV64_INIT;
        hash = mix_u64(hash, self.events.len() as u64);
        hash = mix_u64(hash, u64::from(self.overflow));
        for ev in &self.events {
            hash = mix_u64(hash, u64::from(ev.kind));
            hash = mix_u64(hash, ev.domain_id);
            hash = mix_u64(hash, u64::from(ev.domain_kind));
            hash = mix_u64(hash, ev.capsule_id);
            hash = mix_u64(hash, u64::from(ev.reason_code));
            hash = mix_u64(hash, u64::from(ev.refusal_code as u32));
            hash = mix_u64(hash, u64::from(ev.defer_code as u32));
            hash = mix_u64(hash, u64::from(ev.detail_code));
            hash = mix_u64(hash, u64::from(ev.seed_value));
            hash = mix_u64(hash, u64::from(ev.budget_kind));
            hash = mix_u64(hash, u64::from(ev.budget_limit));
            hash = mix_u64(hash, u64::from(ev.budget_used));
            hash = mix_u64(hash, u64::from(ev.budget_cost));
            hash = mix_u64(hash, u64::from(ev.budget_queue));
            hash = mix_u64(hash, u64::from(ev.budget_overflow));
            hash = mix_u64(hash, ev.tick as u64);
        }
        hash
    }
}

impl Default for ScaleEventLog {
    fn default() -> Self {
        Self::new(256)
    }
}
