// SPDX-License-Identifier: Apache-2.0
//! Lifecycle validity at the runtime level: every logged transition obeys
//! the state-machine diagram, and the log feeds the runtime hash.

use dominium_shard::{
    transition_allowed, LifecycleState, Runtime, RuntimeConfig, RuntimeError,
};

#[test]
fn runtime_transitions_are_logged_and_validated() {
    let mut runtime = Runtime::new(RuntimeConfig {
        shard_count: 2,
        ..RuntimeConfig::default()
    });
    runtime
        .set_shard_state(1, LifecycleState::Draining, 7)
        .expect("active -> draining");
    runtime
        .set_shard_state(1, LifecycleState::Active, 8)
        .expect("draining -> active");
    runtime
        .set_shard_state(2, LifecycleState::Offline, 9)
        .expect("active -> offline");
    let err = runtime.set_shard_state(2, LifecycleState::Draining, 10);
    assert!(matches!(err, Err(RuntimeError::Lifecycle(_))));

    for entry in runtime.lifecycle_log().entries() {
        assert!(
            transition_allowed(entry.from_state, entry.to_state),
            "logged transition violates the diagram: {entry:?}"
        );
    }
    assert_eq!(runtime.lifecycle_log().entries().len(), 3);
}

#[test]
fn lifecycle_log_contributes_to_runtime_hash() {
    let mut a = Runtime::new(RuntimeConfig::default());
    let b = Runtime::new(RuntimeConfig::default());
    assert_eq!(a.runtime_hash(), b.runtime_hash());
    a.set_shard_state(1, LifecycleState::Frozen, 1).expect("freeze");
    assert_ne!(a.runtime_hash(), b.runtime_hash());
}
