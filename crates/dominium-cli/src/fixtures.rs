// SPDX-License-Identifier: Apache-2.0
//! Seeded engines and domains shared by the scenario runners.

use dominium_scale::{
    AgentEntry, BudgetPolicy, DomainKind, DomainPayload, DomainSlot, FidelityTier, MacroPolicy,
    NetworkEdge, NetworkNode, ResourceEntry, ScaleEngine, Tick,
};

/// Domain id of the seeded resource domain.
pub const RESOURCE_DOMAIN: u64 = 11;
/// Domain id of the seeded network domain.
pub const NETWORK_DOMAIN: u64 = 21;
/// Domain id of the seeded agent domain.
pub const AGENT_DOMAIN: u64 = 31;

/// Resource domain with a spread of magnitudes.
pub fn resource_slot(domain_id: u64) -> DomainSlot {
    DomainSlot::new(
        domain_id,
        FidelityTier::Meso,
        DomainPayload::Resources(vec![
            ResourceEntry {
                resource_id: domain_id + 1,
                quantity: 100,
            },
            ResourceEntry {
                resource_id: domain_id + 2,
                quantity: 5,
            },
            ResourceEntry {
                resource_id: domain_id + 3,
                quantity: 2000,
            },
        ]),
    )
}

/// Two-node network with two wearing edges.
pub fn network_slot(domain_id: u64) -> DomainSlot {
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
            capacity_units: 1000,
            buffer_units: 200,
            wear_buckets: [1, 2, 3, 4],
        },
        NetworkEdge {
            edge_id: domain_id + 200,
            from_node_id: domain_id + 20,
            to_node_id: domain_id + 10,
            capacity_units: 500,
            buffer_units: 100,
            wear_buckets: [2, 1, 1, 0],
        },
    ];
    DomainSlot::new(
        domain_id,
        FidelityTier::Micro,
        DomainPayload::Network { nodes, edges },
    )
}

/// Four-agent population across two roles.
pub fn agent_slot(domain_id: u64) -> DomainSlot {
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
                trait_mask: 2,
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

/// A slot of the requested kind at its standard id.
pub fn slot_for_kind(kind: DomainKind) -> DomainSlot {
    match kind {
        DomainKind::Resources => resource_slot(RESOURCE_DOMAIN),
        DomainKind::Network => network_slot(NETWORK_DOMAIN),
        DomainKind::Agents => agent_slot(AGENT_DOMAIN),
    }
}

/// Engine with dwell disabled and the given domains registered.
pub fn engine_with(workers: u32, slots: Vec<DomainSlot>) -> anyhow::Result<ScaleEngine> {
    let mut engine = ScaleEngine::new(0, workers, 2048);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        ..BudgetPolicy::default()
    });
    for slot in slots {
        engine
            .register_domain(slot)
            .map_err(|e| anyhow::anyhow!("domain registration failed: {e}"))?;
    }
    Ok(engine)
}

/// Engine seeded with the three standard domains.
pub fn standard_engine(workers: u32, interval: Tick) -> anyhow::Result<ScaleEngine> {
    let mut engine = engine_with(
        workers,
        vec![
            resource_slot(RESOURCE_DOMAIN),
            network_slot(NETWORK_DOMAIN),
            agent_slot(AGENT_DOMAIN),
        ],
    )?;
    engine.set_macro_policy(MacroPolicy {
        macro_interval_ticks: interval,
        ..MacroPolicy::default()
    });
    Ok(engine)
}

/// Parses a domain-kind argument.
pub fn parse_kind(text: &str) -> Option<DomainKind> {
    match text {
        "resources" => Some(DomainKind::Resources),
        "network" => Some(DomainKind::Network),
        "agents" => Some(DomainKind::Agents),
        _ => None,
    }
}
