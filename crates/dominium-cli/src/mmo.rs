// SPDX-License-Identifier: Apache-2.0
//! Multi-shard runtime scenario runners.

use anyhow::Context;
use clap::{Args, Subcommand};

use dominium_shard::{
    ClientPolicy, Intent, IntentKind, Runtime, RuntimeConfig, RuntimeEventKind, RuntimeRefusal,
    TriggerReason,
};

/// Shared scenario flags.
#[derive(Args, Debug, Clone, Copy)]
pub struct CommonArgs {
    /// Declared worker count; hashes must be identical for any value.
    #[clap(long, default_value_t = 1)]
    pub workers: u32,
}

/// Runtime scenarios.
#[derive(Subcommand, Debug)]
pub enum MmoCmd {
    /// Two runtimes, reversed submission order, equal hashes.
    TwoNode {
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Join and resync bundle sanity, including checkpoint recovery.
    JoinResync {
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// A rate-limited client hammering collapse intents.
    Abuse {
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// An inspect-only, capability-less legacy client.
    Legacy {
        #[clap(flatten)]
        common: CommonArgs,
    },
}

/// Runs an mmo scenario; the returned code is the process exit code.
pub fn run(cmd: &MmoCmd) -> anyhow::Result<u8> {
    match cmd {
        MmoCmd::TwoNode { common } => two_node(common.workers),
        MmoCmd::JoinResync { common } => join_resync(common.workers),
        MmoCmd::Abuse { common } => abuse(common.workers),
        MmoCmd::Legacy { common } => legacy(common.workers),
    }
}

fn runtime(workers: u32) -> anyhow::Result<Runtime> {
    let mut runtime = Runtime::new(RuntimeConfig {
        shard_count: 2,
        worker_count: workers,
        ..RuntimeConfig::default()
    });
    runtime
        .add_client(1, 1, None)
        .map_err(|e| anyhow::anyhow!("add client: {e}"))?;
    Ok(runtime)
}

fn two_node_script(runtime: &Runtime) -> anyhow::Result<Vec<Intent>> {
    let ids = runtime
        .shard_domain_ids(1)
        .map_err(|e| anyhow::anyhow!("shard domains: {e}"))?;
    let d1 = *ids.first().context("first seeded domain")?;
    let d2 = *ids.get(1).context("second seeded domain")?;
    Ok(vec![
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
    ])
}

fn two_node(workers: u32) -> anyhow::Result<u8> {
    let mut a = runtime(workers)?;
    let mut b = runtime(workers)?;
    let script = two_node_script(&a)?;
    for intent in &script {
        a.submit_intent(intent, 0)
            .map_err(|e| anyhow::anyhow!("submit: {e}"))?;
    }
    for intent in script.iter().rev() {
        b.submit_intent(intent, 0)
            .map_err(|e| anyhow::anyhow!("submit: {e}"))?;
    }
    a.tick(4).map_err(|e| anyhow::anyhow!("tick: {e}"))?;
    b.tick(4).map_err(|e| anyhow::anyhow!("tick: {e}"))?;
    let (ha, hb) = (a.runtime_hash(), b.runtime_hash());
    println!(
        "two-node: A {} B {}",
        hex::encode(ha.to_be_bytes()),
        hex::encode(hb.to_be_bytes())
    );
    if ha == hb {
        println!("two-node: OK");
        Ok(0)
    } else {
        println!("two-node: HASH MISMATCH");
        Ok(1)
    }
}

fn join_resync(workers: u32) -> anyhow::Result<u8> {
    let mut rt = runtime(workers)?;
    let script = two_node_script(&rt)?;
    for intent in &script {
        rt.submit_intent(intent, 0)
            .map_err(|e| anyhow::anyhow!("submit: {e}"))?;
    }
    rt.tick(2).map_err(|e| anyhow::anyhow!("tick: {e}"))?;

    let join = rt.join(1).map_err(|e| anyhow::anyhow!("join: {e}"))?;
    println!(
        "join: shard {} tick {} world {}",
        join.assigned_shard_id,
        join.tick,
        hex::encode(join.world_hash.to_be_bytes())
    );
    let resync = rt
        .resync(1, 1, true)
        .map_err(|e| anyhow::anyhow!("resync: {e}"))?;
    println!(
        "resync: refusal {} snapshot domain {:#x} tier {:?}",
        resync.refusal_code.as_str(),
        resync.snapshot.domain_id,
        resync.snapshot.tier
    );

    // Capture, mutate, recover: the hash must come back.
    let hash_at_capture = rt.runtime_hash();
    rt.checkpoint(TriggerReason::Manual);
    rt.tick(6).map_err(|e| anyhow::anyhow!("tick: {e}"))?;
    rt.recover_last().map_err(|e| anyhow::anyhow!("recover: {e}"))?;
    let recovered = rt.runtime_hash();
    println!(
        "recover: {} vs {}",
        hex::encode(hash_at_capture.to_be_bytes()),
        hex::encode(recovered.to_be_bytes())
    );
    if recovered == hash_at_capture && resync.refusal_code == RuntimeRefusal::None {
        println!("join-resync: OK");
        Ok(0)
    } else {
        println!("join-resync: FAILED");
        Ok(1)
    }
}

fn abuse(workers: u32) -> anyhow::Result<u8> {
    let mut rt = Runtime::new(RuntimeConfig {
        shard_count: 1,
        worker_count: workers,
        ..RuntimeConfig::default()
    });
    rt.add_client(
        1,
        1,
        Some(ClientPolicy {
            intents_per_tick: 1,
            bytes_per_tick: 4,
            ..ClientPolicy::default()
        }),
    )
    .map_err(|e| anyhow::anyhow!("add client: {e}"))?;
    let domain = rt
        .shard_domain_ids(1)
        .map_err(|e| anyhow::anyhow!("domains: {e}"))?[0];
    for i in 0..3 {
        rt.submit_intent(
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
        .map_err(|e| anyhow::anyhow!("submit: {e}"))?;
    }
    rt.tick(1).map_err(|e| anyhow::anyhow!("tick: {e}"))?;
    let rate_limited = rt
        .events()
        .iter()
        .filter(|e| e.refusal_code == RuntimeRefusal::RateLimit)
        .count();
    println!("abuse: {rate_limited} rate-limit refusals");
    if rate_limited >= 1 {
        println!("abuse: OK");
        Ok(0)
    } else {
        println!("abuse: NO RATE LIMIT OBSERVED");
        Ok(1)
    }
}

fn legacy(workers: u32) -> anyhow::Result<u8> {
    let mut rt = Runtime::new(RuntimeConfig {
        shard_count: 1,
        worker_count: workers,
        ..RuntimeConfig::default()
    });
    rt.add_client(
        1,
        1,
        Some(ClientPolicy {
            inspect_only: true,
            capability_mask: 0,
            ..ClientPolicy::default()
        }),
    )
    .map_err(|e| anyhow::anyhow!("add client: {e}"))?;
    let domain = rt
        .shard_domain_ids(1)
        .map_err(|e| anyhow::anyhow!("domains: {e}"))?[0];
    for (id, kind) in [
        (301, IntentKind::Collapse),
        (302, IntentKind::MacroAdvance),
        (303, IntentKind::Observe),
    ] {
        rt.submit_intent(
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
        .map_err(|e| anyhow::anyhow!("submit: {e}"))?;
    }
    rt.tick(0).map_err(|e| anyhow::anyhow!("tick: {e}"))?;
    let capability_refusals = rt
        .events()
        .iter()
        .filter(|e| e.refusal_code == RuntimeRefusal::CapabilityMissing)
        .count();
    let accepted_observe = rt
        .events()
        .iter()
        .any(|e| e.event_kind == RuntimeEventKind::IntentAccept as u32);
    let resync_denied = rt
        .resync(1, 1, false)
        .map_err(|e| anyhow::anyhow!("resync: {e}"))?
        .refusal_code
        == RuntimeRefusal::CapabilityMissing;
    println!(
        "legacy: {capability_refusals} capability refusals, observe accepted: {accepted_observe}, resync denied: {resync_denied}"
    );
    if capability_refusals == 2 && accepted_observe && resync_denied {
        println!("legacy: OK");
        Ok(0)
    } else {
        println!("legacy: FAILED");
        Ok(1)
    }
}
