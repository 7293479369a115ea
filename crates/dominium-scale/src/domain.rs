// SPDX-License-Identifier: Apache-2.0
//! Domain slots and their kind-specific payloads.
//!
//! A domain is the unit the scale engine collapses and expands. Payload
//! entries are kept in their natural key order so any traversal — hashing,
//! serialization, diffing — observes the same sequence regardless of
//! insertion order.

/// Simulation time in ticks. Signed so "before tick zero" sentinels and
/// dwell arithmetic stay well-defined.
pub type Tick = i64;

/// Kind of a scale domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum DomainKind {
    /// Stockpiles of fungible resources.
    Resources = 1,
    /// Transport network of nodes and wearing edges.
    Network = 2,
    /// Agent population.
    Agents = 3,
}

impl DomainKind {
    /// Decodes a wire value; unknown values return `None`.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Resources),
            2 => Some(Self::Network),
            3 => Some(Self::Agents),
            _ => None,
        }
    }
}

/// Fidelity tier of a domain.
///
/// `Latent` means the domain exists only as a capsule; `Meso` and `Micro`
/// are expanded forms at increasing detail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum FidelityTier {
    /// Capsule only.
    #[default]
    Latent = 0,
    /// Intermediate expanded form.
    Meso = 1,
    /// Fully expanded form.
    Micro = 2,
}

impl FidelityTier {
    /// Tier-1 accounting bucket (intermediate detail).
    #[must_use]
    pub fn is_tier1(self) -> bool {
        self == Self::Meso
    }

    /// Tier-2 accounting bucket (full detail).
    #[must_use]
    pub fn is_tier2(self) -> bool {
        self >= Self::Micro
    }

    /// Decodes a wire value; unknown values return `None`.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Latent),
            1 => Some(Self::Meso),
            2 => Some(Self::Micro),
            _ => None,
        }
    }
}

/// One resource stockpile entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceEntry {
    /// Stable resource identifier.
    pub resource_id: u64,
    /// Held quantity.
    pub quantity: u64,
}

/// One transport network node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NetworkNode {
    /// Stable node identifier.
    pub node_id: u64,
    /// Node kind tag.
    pub node_kind: u32,
}

/// One transport network edge with four wear buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkEdge {
    /// Stable edge identifier.
    pub edge_id: u64,
    /// Source node id.
    pub from_node_id: u64,
    /// Destination node id.
    pub to_node_id: u64,
    /// Throughput capacity in abstract units.
    pub capacity_units: u64,
    /// Buffered units in flight.
    pub buffer_units: u64,
    /// Wear histogram buckets, least to most worn.
    pub wear_buckets: [u32; 4],
}

impl NetworkEdge {
    fn sort_key(&self) -> (u64, u64, u64) {
        (self.edge_id, self.from_node_id, self.to_node_id)
    }
}

/// One agent entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct AgentEntry {
    /// Stable agent identifier.
    pub agent_id: u64,
    /// Role identifier.
    pub role_id: u32,
    /// Trait bit mask.
    pub trait_mask: u32,
    /// Planning-horizon bucket.
    pub planning_bucket: u32,
}

/// Kind-specific domain payload.
///
/// New domain kinds are new variants; the codec and the hash functions
/// dispatch on the tag. There are deliberately no open extension points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPayload {
    /// Resource stockpiles.
    Resources(Vec<ResourceEntry>),
    /// Transport network.
    Network {
        /// Network nodes.
        nodes: Vec<NetworkNode>,
        /// Network edges.
        edges: Vec<NetworkEdge>,
    },
    /// Agent population.
    Agents(Vec<AgentEntry>),
}

impl DomainPayload {
    /// The kind tag of this payload.
    #[must_use]
    pub fn kind(&self) -> DomainKind {
        match self {
            Self::Resources(_) => DomainKind::Resources,
            Self::Network { .. } => DomainKind::Network,
            Self::Agents(_) => DomainKind::Agents,
        }
    }

    /// Restores the natural key order of every entry list.
    pub fn sort(&mut self) {
        match self {
            Self::Resources(entries) => sort_resources(entries),
            Self::Network { nodes, edges } => {
                sort_nodes(nodes);
                sort_edges(edges);
            }
            Self::Agents(agents) => sort_agents(agents),
        }
    }
}

/// Sorts resource entries by `(resource_id, quantity)`.
pub fn sort_resources(entries: &mut [ResourceEntry]) {
    entries.sort();
}

/// Sorts nodes by `(node_id, node_kind)`.
pub fn sort_nodes(nodes: &mut [NetworkNode]) {
    nodes.sort();
}

/// Sorts edges by `(edge_id, from_node_id, to_node_id)`.
pub fn sort_edges(edges: &mut [NetworkEdge]) {
    edges.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Sorts agents by every field, id first.
pub fn sort_agents(agents: &mut [AgentEntry]) {
    agents.sort();
}

/// One registered domain: identity, current tier, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSlot {
    /// Stable 64-bit domain id.
    pub domain_id: u64,
    /// Current fidelity tier.
    pub tier: FidelityTier,
    /// Tick of the last tier transition.
    pub last_transition_tick: Tick,
    /// Capsule id of the latest collapse, 0 iff never collapsed.
    pub capsule_id: u64,
    /// Kind-specific payload.
    pub payload: DomainPayload,
}

impl DomainSlot {
    /// Creates a slot at the given tier with a sorted payload.
    #[must_use]
    pub fn new(domain_id: u64, tier: FidelityTier, mut payload: DomainPayload) -> Self {
        payload.sort();
        Self {
            domain_id,
            tier,
            last_transition_tick: 0,
            capsule_id: 0,
            payload,
        }
    }

    /// The kind tag of this slot's payload.
    #[must_use]
    pub fn kind(&self) -> DomainKind {
        self.payload.kind()
    }
}
