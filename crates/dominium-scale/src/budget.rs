// SPDX-License-Identifier: Apache-2.0
//! Per-tick budget admission and the deferred-operation queue.
//!
//! Budgets are the engine's only throttle: an admission that does not fit
//! either refuses or defers, never silently drops. Counters reset when a
//! new tick begins; a per-tick limit of zero means unlimited.

use crate::domain::{FidelityTier, Tick};
use crate::event::{detail, RefusalCode};

/// Absolute cap on the deferred queue regardless of policy.
pub const DEFER_QUEUE_CAP: usize = 128;

/// Budget kinds, used in refusal taxonomy and event reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum BudgetKind {
    /// No budget involved.
    #[default]
    None = 0,
    /// Active-domain tier caps.
    ActiveDomain = 1,
    /// Refinement (expansion work) budget.
    Refinement = 2,
    /// Collapse budget.
    Collapse = 3,
    /// Macro-event budget.
    MacroEvent = 4,
    /// Agent planning budget.
    AgentPlanning = 5,
    /// Snapshot budget.
    Snapshot = 6,
    /// Deferred queue capacity.
    DeferQueue = 7,
}

/// Per-tick budget policy. All costs default to one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPolicy {
    /// Cap on tier-2 (micro) domains; used when `active_domain_budget` is 0.
    pub max_tier2_domains: u32,
    /// Cap on tier-1 (meso) domains.
    pub max_tier1_domains: u32,
    /// Overriding tier-2 cap; 0 falls back to `max_tier2_domains`.
    pub active_domain_budget: u32,
    /// Refinement units per tick.
    pub refinement_budget_per_tick: u32,
    /// Cost of one refinement.
    pub refinement_cost_units: u32,
    /// Planning units per tick.
    pub planning_budget_per_tick: u32,
    /// Cost of one planning admission.
    pub planning_cost_units: u32,
    /// Collapse units per tick.
    pub collapse_budget_per_tick: u32,
    /// Expand units per tick.
    pub expand_budget_per_tick: u32,
    /// Cost of one collapse.
    pub collapse_cost_units: u32,
    /// Cost of one expand.
    pub expand_cost_units: u32,
    /// Macro-event executions per tick.
    pub macro_event_budget_per_tick: u32,
    /// Cost of one macro event.
    pub macro_event_cost_units: u32,
    /// Cap on queued macro events.
    pub macro_queue_limit: u32,
    /// Compactions per tick.
    pub compaction_budget_per_tick: u32,
    /// Cost of one compaction.
    pub compaction_cost_units: u32,
    /// Executed-event count that triggers compaction.
    pub compaction_event_threshold: u32,
    /// Idle time that triggers compaction.
    pub compaction_time_threshold: Tick,
    /// Snapshot writes per tick.
    pub snapshot_budget_per_tick: u32,
    /// Cost of one snapshot write.
    pub snapshot_cost_units: u32,
    /// Deferred queue limit (clamped to [`DEFER_QUEUE_CAP`]).
    pub deferred_queue_limit: u32,
    /// Minimum ticks between tier transitions of one domain.
    pub min_dwell_ticks: Tick,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_tier2_domains: 8,
            max_tier1_domains: 32,
            active_domain_budget: 0,
            refinement_budget_per_tick: 64,
            refinement_cost_units: 1,
            planning_budget_per_tick: 64,
            planning_cost_units: 1,
            collapse_budget_per_tick: 16,
            expand_budget_per_tick: 16,
            collapse_cost_units: 1,
            expand_cost_units: 1,
            macro_event_budget_per_tick: 64,
            macro_event_cost_units: 1,
            macro_queue_limit: 4096,
            compaction_budget_per_tick: 8,
            compaction_cost_units: 1,
            compaction_event_threshold: 256,
            compaction_time_threshold: 1024,
            snapshot_budget_per_tick: 32,
            snapshot_cost_units: 1,
            deferred_queue_limit: 64,
            min_dwell_ticks: 4,
        }
    }
}

impl BudgetPolicy {
    /// Effective tier-2 cap.
    #[must_use]
    pub fn tier2_limit(&self) -> u32 {
        if self.active_domain_budget > 0 {
            self.active_domain_budget
        } else {
            self.max_tier2_domains
        }
    }

    /// Effective deferred-queue limit.
    #[must_use]
    pub fn deferred_limit(&self) -> u32 {
        self.deferred_queue_limit.min(DEFER_QUEUE_CAP as u32)
    }
}

/// Kind of a deferred operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum DeferredKind {
    /// Unused slot.
    #[default]
    None = 0,
    /// Deferred collapse.
    Collapse = 1,
    /// Deferred expansion.
    Expand = 2,
    /// Deferred macro event.
    MacroEvent = 3,
    /// Deferred agent planning.
    Planning = 4,
    /// Deferred snapshot write.
    Snapshot = 5,
}

/// One deferred operation awaiting a later tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredOp {
    /// What was deferred.
    pub kind: DeferredKind,
    /// Budget kind that caused the deferral.
    pub budget_kind: BudgetKind,
    /// Domain concerned.
    pub domain_id: u64,
    /// Capsule concerned, 0 when none.
    pub capsule_id: u64,
    /// Tier the operation was targeting.
    pub target_tier: FidelityTier,
    /// Tick at which the deferral was recorded.
    pub requested_tick: Tick,
    /// Caller-supplied reason code.
    pub reason_code: u32,
}

impl DeferredOp {
    fn sort_key(&self) -> (u64, u64, u32, Tick, u32, u32) {
        (
            self.domain_id,
            self.capsule_id,
            self.kind as u32,
            self.requested_tick,
            self.reason_code,
            self.budget_kind as u32,
        )
    }
}

/// Per-tick budget counters, refusal counters, and the deferred queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetState {
    /// Domains currently at tier 2.
    pub active_tier2_domains: u32,
    /// Domains currently at tier 1.
    pub active_tier1_domains: u32,
    /// Refinement units used this tick.
    pub refinement_used: u32,
    /// Planning units used this tick.
    pub planning_used: u32,
    /// Collapse units used this tick.
    pub collapse_used: u32,
    /// Expand units used this tick.
    pub expand_used: u32,
    /// Macro-event units used this tick.
    pub macro_event_used: u32,
    /// Compaction units used this tick.
    pub compaction_used: u32,
    /// Snapshot units used this tick.
    pub snapshot_used: u32,
    /// Tick the per-tick counters belong to.
    pub budget_tick: Tick,
    /// Deferred operations, sorted by [`DeferredOp::sort_key`].
    pub deferred: Vec<DeferredOp>,
    /// Deferrals dropped because the queue was full.
    pub deferred_overflow: u32,
    /// Refusals grouped by budget kind.
    pub refusals: RefusalCounters,
}

/// Refusal counters grouped by budget kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefusalCounters {
    /// Active-domain cap refusals.
    pub active_domain_limit: u32,
    /// Refinement budget refusals.
    pub refinement_budget: u32,
    /// Macro-event budget refusals.
    pub macro_event_budget: u32,
    /// Agent-planning budget refusals.
    pub agent_planning_budget: u32,
    /// Snapshot budget refusals.
    pub snapshot_budget: u32,
    /// Collapse budget refusals.
    pub collapse_budget: u32,
    /// Deferred-queue refusals.
    pub defer_queue_limit: u32,
}

impl BudgetState {
    /// Resets per-tick counters when entering a new tick.
    pub fn begin_tick(&mut self, tick: Tick) {
        if self.budget_tick == tick {
            return;
        }
        self.budget_tick = tick;
        self.refinement_used = 0;
        self.planning_used = 0;
        self.collapse_used = 0;
        self.expand_used = 0;
        self.macro_event_used = 0;
        self.compaction_used = 0;
        self.snapshot_used = 0;
    }

    fn fits(used: u32, cost: u32, limit: u32) -> bool {
        limit == 0 || used + cost.max(1) <= limit
    }

    /// Whether one collapse fits the remaining budget.
    #[must_use]
    pub fn allows_collapse(&self, policy: &BudgetPolicy) -> bool {
        Self::fits(
            self.collapse_used,
            policy.collapse_cost_units,
            policy.collapse_budget_per_tick,
        )
    }

    /// Whether one planning admission fits the remaining budget.
    #[must_use]
    pub fn allows_planning(&self, policy: &BudgetPolicy) -> bool {
        Self::fits(
            self.planning_used,
            policy.planning_cost_units,
            policy.planning_budget_per_tick,
        )
    }

    /// Whether one snapshot write fits the remaining budget.
    #[must_use]
    pub fn allows_snapshot(&self, policy: &BudgetPolicy) -> bool {
        Self::fits(
            self.snapshot_used,
            policy.snapshot_cost_units,
            policy.snapshot_budget_per_tick,
        )
    }

    /// Whether one macro event fits the remaining budget.
    #[must_use]
    pub fn allows_macro_event(&self, policy: &BudgetPolicy) -> bool {
        Self::fits(
            self.macro_event_used,
            policy.macro_event_cost_units,
            policy.macro_event_budget_per_tick,
        )
    }

    /// Whether one compaction fits the remaining budget.
    #[must_use]
    pub fn allows_compaction(&self, policy: &BudgetPolicy) -> bool {
        Self::fits(
            self.compaction_used,
            policy.compaction_cost_units,
            policy.compaction_budget_per_tick,
        )
    }

    /// Whether an expansion to `target_tier` fits budgets and tier caps.
    /// On failure, returns the detail code of the rule that fired.
    pub fn allows_expand(&self, policy: &BudgetPolicy, target_tier: FidelityTier) -> Result<(), u32> {
        if !Self::fits(
            self.refinement_used,
            policy.refinement_cost_units,
            policy.refinement_budget_per_tick,
        ) {
            return Err(detail::BUDGET_REFINEMENT);
        }
        if !Self::fits(
            self.expand_used,
            policy.expand_cost_units,
            policy.expand_budget_per_tick,
        ) {
            return Err(detail::BUDGET_EXPAND);
        }
        let tier2_limit = policy.tier2_limit();
        if target_tier.is_tier2() && tier2_limit > 0 && self.active_tier2_domains >= tier2_limit {
            return Err(detail::ACTIVE_DOMAIN_LIMIT);
        }
        if target_tier.is_tier1()
            && policy.max_tier1_domains > 0
            && self.active_tier1_domains >= policy.max_tier1_domains
        {
            return Err(detail::TIER_CAP);
        }
        Ok(())
    }

    /// Consumes one collapse unit.
    pub fn consume_collapse(&mut self, policy: &BudgetPolicy) {
        self.collapse_used += policy.collapse_cost_units.max(1);
    }

    /// Consumes one expand unit.
    pub fn consume_expand(&mut self, policy: &BudgetPolicy) {
        self.expand_used += policy.expand_cost_units.max(1);
    }

    /// Consumes one refinement unit.
    pub fn consume_refinement(&mut self, policy: &BudgetPolicy) {
        self.refinement_used += policy.refinement_cost_units.max(1);
    }

    /// Consumes one planning unit.
    pub fn consume_planning(&mut self, policy: &BudgetPolicy) {
        self.planning_used += policy.planning_cost_units.max(1);
    }

    /// Consumes one snapshot unit.
    pub fn consume_snapshot(&mut self, policy: &BudgetPolicy) {
        self.snapshot_used += policy.snapshot_cost_units.max(1);
    }

    /// Consumes one macro-event unit.
    pub fn consume_macro_event(&mut self, policy: &BudgetPolicy) {
        self.macro_event_used += policy.macro_event_cost_units.max(1);
    }

    /// Consumes one compaction unit.
    pub fn consume_compaction(&mut self, policy: &BudgetPolicy) {
        self.compaction_used += policy.compaction_cost_units.max(1);
    }

    /// Adjusts the tier counters for a `from -> to` transition.
    pub fn adjust_for_transition(&mut self, from: FidelityTier, to: FidelityTier) {
        if from.is_tier2() {
            self.active_tier2_domains = self.active_tier2_domains.saturating_sub(1);
        } else if from.is_tier1() {
            self.active_tier1_domains = self.active_tier1_domains.saturating_sub(1);
        }
        if to.is_tier2() {
            self.active_tier2_domains += 1;
        } else if to.is_tier1() {
            self.active_tier1_domains += 1;
        }
    }

    /// Enqueues a deferred op in sorted position, deduplicating exact
    /// matches. Returns false (and counts overflow) when the queue is full.
    pub fn enqueue_deferred(&mut self, policy: &BudgetPolicy, op: DeferredOp) -> bool {
        let limit = policy.deferred_limit() as usize;
        match self
            .deferred
            .binary_search_by(|probe| probe.sort_key().cmp(&op.sort_key()))
        {
            Ok(_) => true,
            Err(idx) => {
                if self.deferred.len() >= limit || self.deferred.len() >= DEFER_QUEUE_CAP {
                    self.deferred_overflow += 1;
                    false
                } else {
                    self.deferred.insert(idx, op);
                    true
                }
            }
        }
    }

    /// Removes deferred ops for `domain_id` of `kind`, optionally filtered
    /// by reason code (0 matches any reason).
    pub fn remove_deferred(&mut self, domain_id: u64, kind: DeferredKind, reason_code: u32) {
        self.deferred.retain(|op| {
            !(op.domain_id == domain_id
                && op.kind == kind
                && (reason_code == 0 || op.reason_code == reason_code))
        });
    }

    /// Counts a refusal against its budget kind.
    pub fn record_refusal(&mut self, budget_kind: BudgetKind) {
        match budget_kind {
            BudgetKind::ActiveDomain => self.refusals.active_domain_limit += 1,
            BudgetKind::Refinement => self.refusals.refinement_budget += 1,
            BudgetKind::MacroEvent => self.refusals.macro_event_budget += 1,
            BudgetKind::AgentPlanning => self.refusals.agent_planning_budget += 1,
            BudgetKind::Snapshot => self.refusals.snapshot_budget += 1,
            BudgetKind::Collapse => self.refusals.collapse_budget += 1,
            BudgetKind::DeferQueue => self.refusals.defer_queue_limit += 1,
            BudgetKind::None => {}
        }
    }
}

/// Maps a detail code to the budget kind it reports against.
#[must_use]
pub fn budget_kind_from_detail(detail_code: u32) -> BudgetKind {
    match detail_code {
        detail::ACTIVE_DOMAIN_LIMIT | detail::TIER_CAP => BudgetKind::ActiveDomain,
        detail::BUDGET_REFINEMENT | detail::BUDGET_EXPAND => BudgetKind::Refinement,
        detail::BUDGET_COLLAPSE | detail::BUDGET_COMPACTION => BudgetKind::Collapse,
        detail::BUDGET_MACRO_EVENT | detail::MACRO_QUEUE_LIMIT | detail::MACRO_SCHEDULE => {
            BudgetKind::MacroEvent
        }
        detail::BUDGET_PLANNING => BudgetKind::AgentPlanning,
        detail::BUDGET_SNAPSHOT => BudgetKind::Snapshot,
        detail::DEFER_QUEUE_LIMIT => BudgetKind::DeferQueue,
        _ => BudgetKind::None,
    }
}

/// Maps a budget kind to the refusal code a hard refusal carries.
#[must_use]
pub fn refusal_for_budget(budget_kind: BudgetKind) -> RefusalCode {
    match budget_kind {
        BudgetKind::ActiveDomain => RefusalCode::ActiveDomainLimit,
        BudgetKind::Refinement => RefusalCode::RefinementBudget,
        BudgetKind::MacroEvent => RefusalCode::MacroEventBudget,
        BudgetKind::AgentPlanning => RefusalCode::AgentPlanningBudget,
        BudgetKind::Snapshot => RefusalCode::SnapshotBudget,
        BudgetKind::Collapse => RefusalCode::CollapseBudget,
        BudgetKind::DeferQueue => RefusalCode::DeferQueueLimit,
        BudgetKind::None => RefusalCode::BudgetExceeded,
    }
}

/// Point-in-time view of budget usage, limits, and refusal counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetSnapshot {
    /// Tick the snapshot was taken at.
    pub tick: Tick,
    /// Domains at tier 1.
    pub active_tier1_domains: u32,
    /// Domains at tier 2.
    pub active_tier2_domains: u32,
    /// Tier-1 cap.
    pub tier1_limit: u32,
    /// Effective tier-2 cap.
    pub tier2_limit: u32,
    /// Refinement used / limit.
    pub refinement_used: u32,
    /// Refinement limit.
    pub refinement_limit: u32,
    /// Planning used.
    pub planning_used: u32,
    /// Planning limit.
    pub planning_limit: u32,
    /// Collapse used.
    pub collapse_used: u32,
    /// Collapse limit.
    pub collapse_limit: u32,
    /// Expand used.
    pub expand_used: u32,
    /// Expand limit.
    pub expand_limit: u32,
    /// Macro-event used.
    pub macro_event_used: u32,
    /// Macro-event limit.
    pub macro_event_limit: u32,
    /// Snapshot used.
    pub snapshot_used: u32,
    /// Snapshot limit.
    pub snapshot_limit: u32,
    /// Deferred queue depth.
    pub deferred_count: u32,
    /// Deferred queue overflow count.
    pub deferred_overflow: u32,
    /// Deferred queue limit.
    pub deferred_limit: u32,
    /// Refusal counters.
    pub refusals: RefusalCounters,
}

impl BudgetSnapshot {
    /// Captures the current budget state against its policy.
    #[must_use]
    pub fn capture(state: &BudgetState, policy: &BudgetPolicy, tick: Tick) -> Self {
        Self {
            tick,
            active_tier1_domains: state.active_tier1_domains,
            active_tier2_domains: state.active_tier2_domains,
            tier1_limit: policy.max_tier1_domains,
            tier2_limit: policy.tier2_limit(),
            refinement_used: state.refinement_used,
            refinement_limit: policy.refinement_budget_per_tick,
            planning_used: state.planning_used,
            planning_limit: policy.planning_budget_per_tick,
            collapse_used: state.collapse_used,
            collapse_limit: policy.collapse_budget_per_tick,
            expand_used: state.expand_used,
            expand_limit: policy.expand_budget_per_tick,
            macro_event_used: state.macro_event_used,
            macro_event_limit: policy.macro_event_budget_per_tick,
            snapshot_used: state.snapshot_used,
            snapshot_limit: policy.snapshot_budget_per_tick,
            deferred_count: state.deferred.len() as u32,
            deferred_overflow: state.deferred_overflow,
            deferred_limit: policy.deferred_limit(),
            refusals: state.refusals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(domain: u64, kind: DeferredKind, reason: u32) -> DeferredOp {
        DeferredOp {
            kind,
            domain_id: domain,
            reason_code: reason,
            ..DeferredOp::default()
        }
    }

    #[test]
    fn begin_tick_resets_only_on_new_tick() {
        let policy = BudgetPolicy::default();
        let mut state = BudgetState::default();
        state.begin_tick(1);
        state.consume_collapse(&policy);
        state.begin_tick(1);
        assert_eq!(state.collapse_used, 1);
        state.begin_tick(2);
        assert_eq!(state.collapse_used, 0);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let policy = BudgetPolicy {
            collapse_budget_per_tick: 0,
            ..BudgetPolicy::default()
        };
        let mut state = BudgetState::default();
        for _ in 0..1000 {
            assert!(state.allows_collapse(&policy));
            state.consume_collapse(&policy);
        }
    }

    #[test]
    fn expand_reports_first_violated_rule() {
        let policy = BudgetPolicy {
            refinement_budget_per_tick: 1,
            ..BudgetPolicy::default()
        };
        let mut state = BudgetState::default();
        assert!(state.allows_expand(&policy, FidelityTier::Micro).is_ok());
        state.consume_refinement(&policy);
        assert_eq!(
            state.allows_expand(&policy, FidelityTier::Micro),
            Err(detail::BUDGET_REFINEMENT)
        );
    }

    #[test]
    fn tier2_cap_blocks_micro_expansion() {
        let policy = BudgetPolicy {
            active_domain_budget: 1,
            ..BudgetPolicy::default()
        };
        let mut state = BudgetState::default();
        state.active_tier2_domains = 1;
        assert_eq!(
            state.allows_expand(&policy, FidelityTier::Micro),
            Err(detail::ACTIVE_DOMAIN_LIMIT)
        );
        assert!(state.allows_expand(&policy, FidelityTier::Meso).is_ok());
    }

    #[test]
    fn deferred_queue_sorts_and_dedupes() {
        let policy = BudgetPolicy::default();
        let mut state = BudgetState::default();
        assert!(state.enqueue_deferred(&policy, op(2, DeferredKind::Collapse, 1)));
        assert!(state.enqueue_deferred(&policy, op(1, DeferredKind::Expand, 1)));
        assert!(state.enqueue_deferred(&policy, op(2, DeferredKind::Collapse, 1)));
        assert_eq!(state.deferred.len(), 2);
        assert_eq!(state.deferred[0].domain_id, 1);
    }

    #[test]
    fn deferred_queue_overflow_counts() {
        let policy = BudgetPolicy {
            deferred_queue_limit: 1,
            ..BudgetPolicy::default()
        };
        let mut state = BudgetState::default();
        assert!(state.enqueue_deferred(&policy, op(1, DeferredKind::Collapse, 1)));
        assert!(!state.enqueue_deferred(&policy, op(2, DeferredKind::Collapse, 1)));
        assert_eq!(state.deferred_overflow, 1);
    }

    #[test]
    fn remove_deferred_filters_by_reason() {
        let policy = BudgetPolicy::default();
        let mut state = BudgetState::default();
        state.enqueue_deferred(&policy, op(1, DeferredKind::Collapse, 1));
        state.enqueue_deferred(&policy, op(1, DeferredKind::Collapse, 2));
        state.remove_deferred(1, DeferredKind::Collapse, 2);
        assert_eq!(state.deferred.len(), 1);
        state.remove_deferred(1, DeferredKind::Collapse, 0);
        assert!(state.deferred.is_empty());
    }

    #[test]
    fn detail_to_budget_to_refusal_taxonomy() {
        let kind = budget_kind_from_detail(detail::BUDGET_PLANNING);
        assert_eq!(kind, BudgetKind::AgentPlanning);
        assert_eq!(refusal_for_budget(kind), RefusalCode::AgentPlanningBudget);
        assert_eq!(budget_kind_from_detail(detail::DWELL_TICKS), BudgetKind::None);
    }
}
