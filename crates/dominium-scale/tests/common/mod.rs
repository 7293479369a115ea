// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures for the scale engine integration suites.

use dominium_scale::{
    AgentEntry, BudgetPolicy, DomainPayload, DomainSlot, FidelityTier, NetworkEdge, NetworkNode,
    ResourceEntry, ScaleEngine,
};

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

/// Engine with dwell disabled and the given domains registered.
pub fn engine_with(slots: Vec<DomainSlot>) -> ScaleEngine {
    let mut engine = ScaleEngine::new(0, 1, 1024);
    engine.set_budget_policy(BudgetPolicy {
        min_dwell_ticks: 0,
        ..BudgetPolicy::default()
    });
    for slot in slots {
        engine.register_domain(slot).expect("register domain");
    }
    engine
}
