// SPDX-License-Identifier: Apache-2.0
//! End-to-end determinism scenarios: ordering independence, replay
//! equality, rate-limit abuse, inspect-only clients, idempotent delivery.

use dominium_shard::{
    ClientPolicy, Intent, IntentKind, Runtime, RuntimeConfig, RuntimeEventKind, RuntimeRefusal,
    runtime_detail,
};

fn two_shard_runtime() -> Runtime {
    let mut runtime = Runtime::new(RuntimeConfig {
        shard_count: 2,
        ..RuntimeConfig::default()
    });
    runtime.add_client(1, 1, None).expect("client 1");
    runtime.add_client(2, 2, None).expect("client 2");
    runtime
}

/// The four-intent script of the two-node scenario, with fixed intent ids
/// so both submission orders describe the same stream.
fn two_node_script(runtime: &Runtime) -> Vec<Intent> {
    let d1 = runtime.shard_domain_ids(1).expect("ids")[0];
    let d2 = runtime.shard_domain_ids(1).expect("ids")[1];
    vec![
        Intent {
            intent_id: 101,
            client_id: 1,
            target_shard_id: 1,
            domain_id: d1,
            intent_tick: 0,
            intent_kind: IntentKind::Collapse as u32,
            ..Intent::default()
        },
        Intent {
            intent_id: 102,
            client_id: 1,
            target_shard_id: 1,
            domain_id: d2,
            intent_tick: 0,
            intent_kind: IntentKind::Collapse as u32,
            ..Intent::default()
        },
        Intent {
            intent_id: 103,
            client_id: 1,
            target_shard_id: 1,
            domain_id: d1,
            intent_tick: 1,
            intent_kind: IntentKind::Expand as u32,
            ..Intent::default()
        },
        Intent {
            intent_id: 104,
            client_id: 1,
            target_shard_id: 1,
            domain_id: d1,
            intent_tick: 2,
            intent_kind: IntentKind::TransferOwnership as u32,
            payload_u32: 2,
            ..Intent::default()
        },
    ]
}

#[test]
fn two_node_determinism_is_submission_order_independent() {
    let mut a = two_shard_runtime();
    let mut b = two_shard_runtime();
    let script = two_node_script(&a);

    for intent in &script {
        a.submit_intent(intent, 0).expect("submit a");
    }
    for intent in script.iter().rev() {
        b.submit_intent(intent, 0).expect("submit b");
    }
    a.tick(4).expect("tick a");
    b.tick(4).expect("tick b");
    assert_eq!(a.runtime_hash(), b.runtime_hash());
    assert_eq!(a.events().len(), b.events().len());
}

#[test]
fn replay_from_the_same_stream_is_identical() {
    let run = || {
        let mut runtime = two_shard_runtime();
        for intent in &two_node_script(&runtime) {
            runtime.submit_intent(intent, 0).expect("submit");
        }
        runtime.tick(6).expect("tick");
        runtime
    };
    let a = run();
    let b = run();
    assert_eq!(a.runtime_hash(), b.runtime_hash());
    assert_eq!(a.events(), b.events());
}

#[test]
fn hashes_agree_after_every_tick() {
    let mut a = two_shard_runtime();
    let mut b = two_shard_runtime();
    let script = two_node_script(&a);
    for intent in &script {
        a.submit_intent(intent, 0).expect("submit a");
    }
    for intent in script.iter().rev() {
        b.submit_intent(intent, 0).expect("submit b");
    }
    for tick in 0..=4 {
        a.tick(tick).expect("tick a");
        b.tick(tick).expect("tick b");
        assert_eq!(a.runtime_hash(), b.runtime_hash(), "diverged at tick {tick}");
    }
}

#[test]
fn worker_count_never_reaches_the_hash() {
    let run = |workers: u32| {
        let mut runtime = Runtime::new(RuntimeConfig {
            shard_count: 2,
            worker_count: workers,
            ..RuntimeConfig::default()
        });
        runtime.add_client(1, 1, None).expect("client");
        for intent in &two_node_script(&runtime) {
            runtime.submit_intent(intent, 0).expect("submit");
        }
        runtime.tick(4).expect("tick");
        runtime.runtime_hash()
    };
    assert_eq!(run(1), run(4));
    assert_eq!(run(1), run(32));
}

#[test]
fn abuse_client_hits_the_rate_limit() {
    let mut runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .add_client(
            1,
            1,
            Some(ClientPolicy {
                intents_per_tick: 1,
                bytes_per_tick: 4,
                ..ClientPolicy::default()
            }),
        )
        .expect("client");
    let domain = runtime.shard_domain_ids(1).expect("ids")[0];
    for i in 0..3 {
        runtime
            .submit_intent(
                &Intent {
                    intent_id: 900 + i,
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: domain,
                    intent_tick: 0,
                    intent_kind: IntentKind::Collapse as u32,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
    }
    runtime.tick(1).expect("tick");
    let rate_limited = runtime
        .events()
        .iter()
        .filter(|e| e.refusal_code == RuntimeRefusal::RateLimit)
        .count();
    assert!(rate_limited >= 1, "expected at least one REFUSE_RATE_LIMIT");
}

#[test]
fn inspect_only_client_is_read_only() {
    let mut runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .add_client(
            1,
            1,
            Some(ClientPolicy {
                inspect_only: true,
                capability_mask: 0,
                ..ClientPolicy::default()
            }),
        )
        .expect("client");
    let domain = runtime.shard_domain_ids(1).expect("ids")[0];
    for (id, kind) in [
        (301, IntentKind::Collapse),
        (302, IntentKind::Expand),
        (303, IntentKind::MacroAdvance),
        (304, IntentKind::TransferOwnership),
    ] {
        runtime
            .submit_intent(
                &Intent {
                    intent_id: id,
                    client_id: 1,
                    target_shard_id: 1,
                    domain_id: domain,
                    intent_tick: 0,
                    intent_kind: kind as u32,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
    }
    runtime.tick(0).expect("tick");
    let refusals: Vec<_> = runtime
        .events()
        .iter()
        .filter(|e| e.event_kind == RuntimeEventKind::IntentRefuse as u32)
        .collect();
    assert_eq!(refusals.len(), 4);
    assert!(refusals
        .iter()
        .all(|e| e.refusal_code == RuntimeRefusal::CapabilityMissing
            && e.detail_code == runtime_detail::INSPECT_ONLY));

    // Resync without allow_partial refuses; OBSERVE still works.
    let denied = runtime.resync(1, 1, false).expect("resync");
    assert_eq!(denied.refusal_code, RuntimeRefusal::CapabilityMissing);
    runtime
        .submit_intent(
            &Intent {
                intent_id: 305,
                client_id: 1,
                target_shard_id: 1,
                domain_id: domain,
                intent_tick: 1,
                intent_kind: IntentKind::Observe as u32,
                ..Intent::default()
            },
            0,
        )
        .expect("submit");
    runtime.tick(1).expect("tick");
    assert!(runtime
        .events()
        .iter()
        .any(|e| e.event_kind == RuntimeEventKind::IntentAccept as u32));
}

#[test]
fn duplicate_transfer_message_applies_once() {
    let mut runtime = two_shard_runtime();
    // Two clients on shard 1 issue transfers sharing one idempotency key:
    // client-level dedupe does not fire (keys are per client), so two
    // messages are minted, and the log skips the duplicate at delivery.
    runtime.add_client(3, 1, None).expect("client 3");
    let domain = runtime.shard_domain_ids(1).expect("ids")[0];
    for (id, client) in [(601, 1), (602, 3)] {
        runtime
            .submit_intent(
                &Intent {
                    intent_id: id,
                    client_id: client,
                    target_shard_id: 1,
                    domain_id: domain,
                    intent_tick: 0,
                    idempotency_key: 0x5eed,
                    intent_kind: IntentKind::TransferOwnership as u32,
                    payload_u32: 2,
                    ..Intent::default()
                },
                0,
            )
            .expect("submit");
    }
    runtime.tick(2).expect("tick");
    assert_eq!(runtime.message_sequence(), 2, "two messages minted");
    assert_eq!(runtime.message_applied(), 1, "one message applied");
    let applied = runtime
        .events()
        .iter()
        .filter(|e| e.event_kind == RuntimeEventKind::MessageApply as u32)
        .count();
    assert_eq!(applied, 1);
}

#[test]
fn macro_advance_requires_capability_bit() {
    let mut runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .add_client(
            1,
            1,
            Some(ClientPolicy {
                capability_mask: 0,
                ..ClientPolicy::default()
            }),
        )
        .expect("client");
    let domain = runtime.shard_domain_ids(1).expect("ids")[0];
    runtime
        .submit_intent(
            &Intent {
                intent_id: 700,
                client_id: 1,
                target_shard_id: 1,
                domain_id: domain,
                intent_tick: 0,
                intent_kind: IntentKind::MacroAdvance as u32,
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
    assert_eq!(refusal.refusal_code, RuntimeRefusal::CapabilityMissing);
    assert_eq!(refusal.detail_code, runtime_detail::MACRO_UNSUPPORTED);
}
