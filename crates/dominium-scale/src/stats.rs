// SPDX-License-Identifier: Apache-2.0
//! Bucketed distributions and the invariant/statistic hash pair.
//!
//! Each domain kind has two authoritative hashes:
//!
//! - the **invariant hash** covers exact, sorted entry content (plus kind
//!   and source tick), and
//! - the **statistic hash** covers bucketed distributions only.
//!
//! Expansion recomputes both from the reconstructed payload and refuses on
//! any mismatch with the values recorded in the capsule. Inputs are assumed
//! sorted; callers sort copies before hashing.

use crate::domain::{AgentEntry, DomainKind, DomainSlot, NetworkEdge, ResourceEntry, Tick};
use crate::hashing::{hash_tick, hash_u32, hash_u64, FNV64_INIT};

/// Resource magnitude buckets `[0,10) [10,100) [100,1000) [1000,inf)` and
/// total quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceBuckets {
    /// Entry counts per magnitude bucket.
    pub buckets: [u64; 4],
    /// Sum of all quantities.
    pub total_quantity: u64,
}

/// Aggregate wear distribution over a network's edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WearDistribution {
    /// Summed wear bucket counts, least to most worn.
    pub buckets: [u32; 4],
    /// Integer mean bucket index, `sum(i * b_i) / sum(b_i)`.
    pub mean: u32,
    /// First bucket index where the cumulative count reaches 95% of total.
    pub p95: u32,
}

/// `(role_id, trait_mask)` histogram bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleTraitBucket {
    /// Role identifier.
    pub role_id: u32,
    /// Trait bit mask.
    pub trait_mask: u32,
    /// Number of agents in the bucket.
    pub count: u32,
}

/// Planning-horizon histogram bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlanningBucket {
    /// Planning-horizon bucket value.
    pub planning_bucket: u32,
    /// Number of agents in the bucket.
    pub count: u32,
}

/// Buckets resource quantities by magnitude.
#[must_use]
pub fn resource_buckets(entries: &[ResourceEntry]) -> ResourceBuckets {
    let mut out = ResourceBuckets::default();
    for entry in entries {
        let qty = entry.quantity;
        out.total_quantity = out.total_quantity.wrapping_add(qty);
        let idx = if qty < 10 {
            0
        } else if qty < 100 {
            1
        } else if qty < 1000 {
            2
        } else {
            3
        };
        out.buckets[idx] += 1;
    }
    out
}

/// Sums edge wear buckets and derives the integer mean and p95 indices.
#[must_use]
pub fn wear_distribution(edges: &[NetworkEdge]) -> WearDistribution {
    let mut totals = [0u64; 4];
    for edge in edges {
        for (i, b) in edge.wear_buckets.iter().enumerate() {
            totals[i] += u64::from(*b);
        }
    }
    let total: u64 = totals.iter().sum();
    let mut out = WearDistribution {
        buckets: [
            totals[0] as u32,
            totals[1] as u32,
            totals[2] as u32,
            totals[3] as u32,
        ],
        mean: 0,
        p95: 0,
    };
    if total > 0 {
        let weighted = totals[1] + 2 * totals[2] + 3 * totals[3];
        out.mean = (weighted / total) as u32;
        // ceil(0.95 * total) without floats
        let target = (total * 95 + 99) / 100;
        let mut accum = totals[0];
        out.p95 = if accum >= target {
            0
        } else {
            accum += totals[1];
            if accum >= target {
                1
            } else {
                accum += totals[2];
                if accum >= target {
                    2
                } else {
                    3
                }
            }
        };
    }
    out
}

/// Builds the sorted `(role_id, trait_mask)` and planning histograms.
#[must_use]
pub fn agent_buckets(agents: &[AgentEntry]) -> (Vec<RoleTraitBucket>, Vec<PlanningBucket>) {
    let mut role_trait: Vec<RoleTraitBucket> = Vec::new();
    let mut planning: Vec<PlanningBucket> = Vec::new();
    for agent in agents {
        match role_trait
            .binary_search_by(|b| (b.role_id, b.trait_mask).cmp(&(agent.role_id, agent.trait_mask)))
        {
            Ok(i) => role_trait[i].count += 1,
            Err(i) => role_trait.insert(
                i,
                RoleTraitBucket {
                    role_id: agent.role_id,
                    trait_mask: agent.trait_mask,
                    count: 1,
                },
            ),
        }
        match planning.binary_search_by(|b| b.planning_bucket.cmp(&agent.planning_bucket)) {
            Ok(i) => planning[i].count += 1,
            Err(i) => planning.insert(
                i,
                PlanningBucket {
                    planning_bucket: agent.planning_bucket,
                    count: 1,
                },
            ),
        }
    }
    (role_trait, planning)
}

/// Invariant hash over sorted resource entries.
#[must_use]
pub fn resource_invariant_hash(entries: &[ResourceEntry], source_tick: Tick) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u32(hash, DomainKind::Resources as u32);
    hash = hash_tick(hash, source_tick);
    hash = hash_u32(hash, entries.len() as u32);
    for entry in entries {
        hash = hash_u64(hash, entry.resource_id);
        hash = hash_u64(hash, entry.quantity);
    }
    hash
}

/// Statistic hash over resource magnitude buckets.
#[must_use]
pub fn resource_statistic_hash(entries: &[ResourceEntry]) -> u64 {
    let b = resource_buckets(entries);
    let mut hash = FNV64_INIT;
    hash = hash_u32(hash, DomainKind::Resources as u32);
    for bucket in b.buckets {
        hash = hash_u64(hash, bucket);
    }
    hash_u64(hash, b.total_quantity)
}

/// Invariant hash over sorted network nodes and edges.
///
/// Wear buckets are excluded here; they belong to the statistic hash.
#[must_use]
pub fn network_invariant_hash(
    nodes: &[crate::domain::NetworkNode],
    edges: &[NetworkEdge],
    source_tick: Tick,
) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u32(hash, DomainKind::Network as u32);
    hash = hash_tick(hash, source_tick);
    hash = hash_u32(hash, nodes.len() as u32);
    for node in nodes {
        hash = hash_u64(hash, node.node_id);
        hash = hash_u32(hash, node.node_kind);
    }
    hash = hash_u32(hash, edges.len() as u32);
    for edge in edges {
        hash = hash_u64(hash, edge.edge_id);
        hash = hash_u64(hash, edge.from_node_id);
        hash = hash_u64(hash, edge.to_node_id);
        hash = hash_u64(hash, edge.capacity_units);
        hash = hash_u64(hash, edge.buffer_units);
    }
    hash
}

/// Statistic hash over the aggregate wear distribution.
#[must_use]
pub fn network_statistic_hash(edges: &[NetworkEdge]) -> u64 {
    let dist = wear_distribution(edges);
    let mut hash = FNV64_INIT;
    hash = hash_u32(hash, DomainKind::Network as u32);
    for bucket in dist.buckets {
        hash = hash_u32(hash, bucket);
    }
    hash = hash_u32(hash, dist.mean);
    hash_u32(hash, dist.p95)
}

/// Invariant hash for agent domains: kind, tick, and population count only.
/// Per-agent detail is regenerable and therefore not an invariant.
#[must_use]
pub fn agent_invariant_hash(count: u32, source_tick: Tick) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u32(hash, DomainKind::Agents as u32);
    hash = hash_tick(hash, source_tick);
    hash_u32(hash, count)
}

/// Statistic hash over the role/trait and planning histograms.
#[must_use]
pub fn agent_statistic_hash(agents: &[AgentEntry]) -> u64 {
    let (role_trait, planning) = agent_buckets(agents);
    let mut hash = FNV64_INIT;
    hash = hash_u32(hash, DomainKind::Agents as u32);
    hash = hash_u32(hash, role_trait.len() as u32);
    for b in &role_trait {
        hash = hash_u32(hash, b.role_id);
        hash = hash_u32(hash, b.trait_mask);
        hash = hash_u32(hash, b.count);
    }
    hash = hash_u32(hash, planning.len() as u32);
    for b in &planning {
        hash = hash_u32(hash, b.planning_bucket);
        hash = hash_u32(hash, b.count);
    }
    hash
}

/// Combined domain hash: the invariant and statistic hashes of a sorted
/// copy of the payload, folded together. `worker_count` is accepted so the
/// signature commits to worker-independence; it is deliberately unused.
#[must_use]
pub fn domain_hash(slot: &DomainSlot, now_tick: Tick, worker_count: u32) -> u64 {
    let _ = worker_count;
    let (inv, stat) = match &slot.payload {
        crate::domain::DomainPayload::Resources(entries) => {
            let mut copy = entries.clone();
            crate::domain::sort_resources(&mut copy);
            (
                resource_invariant_hash(&copy, now_tick),
                resource_statistic_hash(&copy),
            )
        }
        crate::domain::DomainPayload::Network { nodes, edges } => {
            let mut n = nodes.clone();
            let mut e = edges.clone();
            crate::domain::sort_nodes(&mut n);
            crate::domain::sort_edges(&mut e);
            (
                network_invariant_hash(&n, &e, now_tick),
                network_statistic_hash(&e),
            )
        }
        crate::domain::DomainPayload::Agents(agents) => {
            let mut copy = agents.clone();
            crate::domain::sort_agents(&mut copy);
            (
                agent_invariant_hash(copy.len() as u32, now_tick),
                agent_statistic_hash(&copy),
            )
        }
    };
    let mut hash = FNV64_INIT;
    hash = hash_u64(hash, inv);
    hash_u64(hash, stat)
}

/// Checks a reconstructed wear distribution against the recorded one.
///
/// Bucket counts must match exactly; mean and p95 tolerate a drift of
/// `max(1, expected / 100)`.
#[must_use]
pub fn wear_within_tolerance(expected: &WearDistribution, edges: &[NetworkEdge]) -> bool {
    let actual = wear_distribution(edges);
    if actual.buckets != expected.buckets {
        return false;
    }
    let allow = |e: u32| (e / 100).max(1);
    actual.mean.abs_diff(expected.mean) <= allow(expected.mean)
        && actual.p95.abs_diff(expected.p95) <= allow(expected.p95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainPayload, FidelityTier};

    fn edge(wear: [u32; 4]) -> NetworkEdge {
        NetworkEdge {
            wear_buckets: wear,
            ..NetworkEdge::default()
        }
    }

    #[test]
    fn resource_bucket_boundaries() {
        let entries = [0u64, 9, 10, 99, 100, 999, 1000, 5000]
            .iter()
            .enumerate()
            .map(|(i, q)| ResourceEntry {
                resource_id: i as u64,
                quantity: *q,
            })
            .collect::<Vec<_>>();
        let b = resource_buckets(&entries);
        assert_eq!(b.buckets, [2, 2, 2, 2]);
        assert_eq!(b.total_quantity, 7218);
    }

    #[test]
    fn wear_mean_and_p95() {
        let dist = wear_distribution(&[edge([1, 2, 3, 4]), edge([2, 1, 1, 0])]);
        assert_eq!(dist.buckets, [3, 3, 4, 4]);
        // weighted = 3 + 8 + 12 = 23, total = 14 -> mean 1
        assert_eq!(dist.mean, 1);
        // target = ceil(13.3) = 14 -> cumulative reaches 14 at bucket 3
        assert_eq!(dist.p95, 3);
    }

    #[test]
    fn wear_empty_is_zero() {
        let dist = wear_distribution(&[]);
        assert_eq!(dist, WearDistribution::default());
    }

    #[test]
    fn statistic_hash_is_order_invariant() {
        let a = vec![
            AgentEntry {
                agent_id: 1,
                role_id: 1,
                trait_mask: 2,
                planning_bucket: 0,
            },
            AgentEntry {
                agent_id: 2,
                role_id: 2,
                trait_mask: 1,
                planning_bucket: 1,
            },
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(agent_statistic_hash(&a), agent_statistic_hash(&b));
    }

    #[test]
    fn agent_invariant_ignores_detail() {
        // Only the count is invariant; roles and traits are regenerable.
        assert_eq!(agent_invariant_hash(4, 10), agent_invariant_hash(4, 10));
        assert_ne!(agent_invariant_hash(4, 10), agent_invariant_hash(5, 10));
    }

    #[test]
    fn domain_hash_insertion_order_invariant() {
        let make = |swap: bool| {
            let mut entries = vec![
                ResourceEntry {
                    resource_id: 1,
                    quantity: 10,
                },
                ResourceEntry {
                    resource_id: 2,
                    quantity: 20,
                },
            ];
            if swap {
                entries.reverse();
            }
            DomainSlot {
                domain_id: 5,
                tier: FidelityTier::Meso,
                last_transition_tick: 0,
                capsule_id: 0,
                payload: DomainPayload::Resources(entries),
            }
        };
        assert_eq!(domain_hash(&make(false), 3, 1), domain_hash(&make(true), 3, 4));
    }

    #[test]
    fn wear_tolerance_exact_buckets_required() {
        let edges = vec![edge([1, 2, 3, 4])];
        let expected = wear_distribution(&edges);
        assert!(wear_within_tolerance(&expected, &edges));
        let off = vec![edge([2, 2, 3, 4])];
        assert!(!wear_within_tolerance(&expected, &off));
    }

    #[test]
    fn wear_tolerance_allows_unit_drift() {
        let edges = vec![edge([4, 4, 4, 4])];
        let mut expected = wear_distribution(&edges);
        expected.mean += 1;
        assert!(wear_within_tolerance(&expected, &edges));
        expected.mean += 2;
        assert!(!wear_within_tolerance(&expected, &edges));
    }
}
