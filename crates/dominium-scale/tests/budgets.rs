// SPDX-License-Identifier: Apache-2.0
//! Budget admission, deferral accounting, and refusal taxonomy.

mod common;

use common::{engine_with, resource_slot};
use dominium_scale::{
    detail, BudgetKind, BudgetPolicy, CommitToken, DeferCode, DeferredKind, RefusalCode,
    ScaleEventKind,
};

#[test]
fn defer_queue_overflow_becomes_refusal() {
    let slots = (1..=4).map(|i| resource_slot(i * 10)).collect();
    let mut engine = engine_with(slots);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        collapse_budget_per_tick: 1,
        deferred_queue_limit: 2,
        ..BudgetPolicy::default()
    });
    let token = CommitToken::new(0);
    assert!(engine.collapse_domain(&token, 10, 1).expect("c").admitted());
    // Budget is gone: the next two defer, the fourth overflows the queue.
    assert_eq!(
        engine.collapse_domain(&token, 20, 1).expect("c").defer_code,
        DeferCode::Collapse
    );
    assert_eq!(
        engine.collapse_domain(&token, 30, 1).expect("c").defer_code,
        DeferCode::Collapse
    );
    let overflowed = engine.collapse_domain(&token, 40, 1).expect("c");
    assert_eq!(overflowed.refusal_code, RefusalCode::DeferQueueLimit);
    assert_eq!(engine.budget_state().deferred_overflow, 1);
    assert_eq!(engine.budget_state().refusals.defer_queue_limit, 1);

    let snapshot = engine.budget_snapshot();
    assert_eq!(snapshot.deferred_count, 2);
    assert_eq!(snapshot.deferred_overflow, 1);
    assert_eq!(snapshot.deferred_limit, 2);
}

#[test]
fn zero_deferred_limit_refuses_with_budget_code() {
    let mut engine = engine_with(vec![resource_slot(10), resource_slot(20)]);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        collapse_budget_per_tick: 1,
        deferred_queue_limit: 0,
        ..BudgetPolicy::default()
    });
    let token = CommitToken::new(0);
    assert!(engine.collapse_domain(&token, 10, 1).expect("c").admitted());
    let refused = engine.collapse_domain(&token, 20, 1).expect("c");
    assert_eq!(refused.refusal_code, RefusalCode::CollapseBudget);
    assert_eq!(engine.budget_state().refusals.collapse_budget, 1);
}

#[test]
fn refusal_events_carry_budget_details() {
    let mut engine = engine_with(vec![resource_slot(10), resource_slot(20)]);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        collapse_budget_per_tick: 1,
        deferred_queue_limit: 0,
        ..BudgetPolicy::default()
    });
    let token = CommitToken::new(0);
    engine.collapse_domain(&token, 10, 1).expect("c");
    engine.collapse_domain(&token, 20, 1).expect("c");
    let refusal = engine
        .event_log()
        .events()
        .iter()
        .find(|e| e.kind == ScaleEventKind::Refusal as u32)
        .expect("refusal event");
    assert_eq!(refusal.budget_kind, BudgetKind::Collapse as u32);
    assert_eq!(refusal.budget_limit, 1);
    assert_eq!(refusal.budget_used, 1);
    assert_eq!(refusal.budget_cost, 1);
    assert_eq!(refusal.detail_code, detail::BUDGET_COLLAPSE);
}

#[test]
fn snapshot_budget_gates_collapse() {
    let mut engine = engine_with(vec![resource_slot(10), resource_slot(20)]);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        snapshot_budget_per_tick: 1,
        ..BudgetPolicy::default()
    });
    let token = CommitToken::new(0);
    assert!(engine.collapse_domain(&token, 10, 1).expect("c").admitted());
    let deferred = engine.collapse_domain(&token, 20, 1).expect("c");
    assert_eq!(deferred.defer_code, DeferCode::Collapse);
    let op = engine.deferred_get(0).expect("op");
    assert_eq!(op.kind, DeferredKind::Snapshot);
    assert_eq!(op.budget_kind, BudgetKind::Snapshot);
}

#[test]
fn deferred_queue_is_inspectable_and_clearable() {
    let mut engine = engine_with(vec![resource_slot(10), resource_slot(20)]);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        collapse_budget_per_tick: 1,
        ..BudgetPolicy::default()
    });
    let token = CommitToken::new(0);
    engine.collapse_domain(&token, 10, 1).expect("c");
    engine.collapse_domain(&token, 20, 1).expect("c");
    assert_eq!(engine.deferred_len(), 1);
    let op = engine.deferred_get(0).expect("op");
    assert_eq!(op.domain_id, 20);
    assert_eq!(op.requested_tick, 0);
    engine.deferred_clear();
    assert_eq!(engine.deferred_len(), 0);
}

#[test]
fn per_tick_counters_reset_on_new_tick_only() {
    let mut engine = engine_with(vec![resource_slot(10), resource_slot(20)]);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        collapse_budget_per_tick: 1,
        ..BudgetPolicy::default()
    });
    let token = CommitToken::new(0);
    engine.collapse_domain(&token, 10, 1).expect("c");
    assert_eq!(engine.budget_state().collapse_used, 1);
    engine.begin_tick(0);
    assert_eq!(engine.budget_state().collapse_used, 1);
    engine.begin_tick(1);
    assert_eq!(engine.budget_state().collapse_used, 0);
}
