// SPDX-License-Identifier: Apache-2.0
//! Capsule codec: self-describing binary capsules for latent domains.
//!
//! Wire format (all fixed-width integers big-endian):
//!
//! ```text
//! u32  version = 1
//! str  schema tag ("dominium.schema.macro_capsule@1.0.0")
//! u64  capsule_id
//! u64  domain_id
//! u32  domain_kind
//! i64  source_tick
//! u32  collapse_reason
//! u32  seed_base
//! u64  invariant_hash
//! u64  statistic_hash
//! strlist invariant ids
//! strlist statistic ids
//! u32  extension_len
//! [kind-specific payload]
//! [extensions: u32 count, (str key, str value)* sorted by key]
//! ```
//!
//! Payloads:
//! - Resources: `u32 count, [u64 id, u64 qty]*, u64 bucket0..3, u64 total`
//! - Network: nodes (`u64 id, u32 kind`), edges (`u64 id, u64 from,
//!   u64 to, u64 capacity, u64 buffer, u32 wear0..3`), then aggregate
//!   `u32 b0..b3, u32 mean, u32 p95`
//! - Agents: agents (`u64 id, u32 role, u32 traits, u32 planning`), then
//!   sorted `(role, traits, count)` buckets, then sorted
//!   `(planning, count)` buckets
//!
//! The recorded invariant and statistic hashes are authoritative:
//! expansion recomputes both from the reconstructed payload and refuses on
//! mismatch.

use bytes::Bytes;
use thiserror::Error;

use crate::domain::{
    sort_agents, sort_edges, sort_nodes, sort_resources, AgentEntry, DomainKind, DomainPayload,
    DomainSlot, NetworkEdge, NetworkNode, ResourceEntry, Tick,
};
use crate::rng::{rng_state_from_seed, EXT_RNG_AGENTS_RECONSTRUCT, STREAM_AGENTS_RECONSTRUCT};
use crate::stats::{
    agent_buckets, agent_invariant_hash, agent_statistic_hash, network_invariant_hash,
    network_statistic_hash, resource_buckets, resource_invariant_hash, resource_statistic_hash,
    ResourceBuckets, WearDistribution,
};
use crate::wire::{check_version, string_len, string_list_len, Reader, WireError, Writer};

/// Capsule format version.
pub const CAPSULE_VERSION: u32 = 1;

/// Capsule schema tag.
pub const CAPSULE_SCHEMA: &str = "dominium.schema.macro_capsule@1.0.0";

/// Maximum accepted schema-tag length when parsing.
const SCHEMA_CAP: usize = 64;

/// Required marker extension present on every capsule.
pub const EXT_SCALE1_KEY: &str = "dominium.scale1";
/// Value of the marker extension.
pub const EXT_SCALE1_VALUE: &str = "v1";

/// Extension key: tick of the last executed macro event.
pub const EXT_MACRO_LAST_TICK: &str = "dominium.scale2.macro_last_tick";
/// Extension key: macro events executed.
pub const EXT_MACRO_EVENTS: &str = "dominium.scale2.macro_events";
/// Extension key: history compacted through this tick.
pub const EXT_COMPACTED_THROUGH: &str = "dominium.scale2.compacted_through";
/// Extension key: macro interval in ticks.
pub const EXT_MACRO_INTERVAL: &str = "dominium.scale2.macro_interval";
/// Extension key: narrative events executed.
pub const EXT_NARRATIVE_EVENTS: &str = "dominium.scale2.narrative_events";

/// Invariant ids recorded in every capsule, kind-independent.
pub const INVARIANT_IDS: [&str; 6] = [
    "SCALE0-PROJECTION-001",
    "SCALE0-CONSERVE-002",
    "SCALE0-COMMIT-003",
    "SCALE0-DETERMINISM-004",
    "SCALE0-NO-EXNIHILO-007",
    "SCALE0-REPLAY-008",
];

/// Statistic ids for resource capsules.
pub const STAT_IDS_RESOURCES: [&str; 1] = ["DOM-SCALE-RESOURCE-BUCKETS"];
/// Statistic ids for network capsules.
pub const STAT_IDS_NETWORK: [&str; 1] = ["STAT-SCALE-WEAR-DIST"];
/// Statistic ids for agent capsules.
pub const STAT_IDS_AGENTS: [&str; 2] = [
    "DOM-SCALE-ROLE-TRAIT-DIST",
    "DOM-SCALE-PLANNING-HORIZON-DIST",
];

/// Statistic ids for `kind`.
#[must_use]
pub fn statistic_ids(kind: DomainKind) -> &'static [&'static str] {
    match kind {
        DomainKind::Resources => &STAT_IDS_RESOURCES,
        DomainKind::Network => &STAT_IDS_NETWORK,
        DomainKind::Agents => &STAT_IDS_AGENTS,
    }
}

/// Errors raised by the capsule codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Wire-level decode failure.
    #[error("capsule decode failed: {0}")]
    Wire(#[from] WireError),
    /// The domain kind tag is not a known variant.
    #[error("unknown domain kind {0}")]
    UnknownKind(u32),
}

/// Parsed capsule header fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapsuleSummary {
    /// Capsule id.
    pub capsule_id: u64,
    /// Domain the capsule belongs to.
    pub domain_id: u64,
    /// Raw domain kind tag.
    pub domain_kind: u32,
    /// Tick the content is current as of.
    pub source_tick: Tick,
    /// Reason code of the producing collapse.
    pub collapse_reason: u32,
    /// 32-bit seed base.
    pub seed_base: u32,
    /// Recorded invariant hash.
    pub invariant_hash: u64,
    /// Recorded statistic hash.
    pub statistic_hash: u64,
    /// Number of invariant ids recorded.
    pub invariant_count: u32,
    /// Number of statistic ids recorded.
    pub statistic_count: u32,
}

/// Fully parsed capsule: summary, payload, and extension map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapsuleData {
    /// Header fields.
    pub summary: CapsuleSummary,
    /// Schema tag as read.
    pub schema: String,
    /// Extension map, sorted by key.
    pub extensions: Vec<(String, String)>,
    /// Declared extension-block length.
    pub extension_len: u32,
    /// Whether the extension block parsed cleanly end to end.
    pub extension_parse_ok: bool,
    /// Agent-reconstruction RNG state, when the extension was present.
    pub rng_state_agents: Option<u32>,

    /// Resource entries (resource capsules).
    pub resources: Vec<ResourceEntry>,
    /// Recorded resource buckets as read from the blob.
    pub resource_buckets: ResourceBuckets,

    /// Network nodes (network capsules).
    pub nodes: Vec<NetworkNode>,
    /// Network edges (network capsules).
    pub edges: Vec<NetworkEdge>,
    /// Recorded wear distribution as read from the blob.
    pub wear: WearDistribution,

    /// Agent entries (agent capsules).
    pub agents: Vec<AgentEntry>,
    /// Recorded agent count. Equal to `agents.len()` after a parse; a
    /// larger value with an empty list marks a payload-free capsule whose
    /// agents must be synthesized from the RNG extension.
    pub agent_count: u32,
}

impl CapsuleData {
    /// Looks up an extension value.
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|idx| self.extensions[idx].1.as_str())
    }

    /// Inserts or updates an extension, keeping the map sorted.
    pub fn set_extension(&mut self, key: &str, value: &str) {
        match self.extensions.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(idx) => self.extensions[idx].1 = value.to_owned(),
            Err(idx) => self.extensions.insert(idx, (key.to_owned(), value.to_owned())),
        }
    }

    /// Inserts or updates a decimal `u64` extension.
    pub fn set_extension_u64(&mut self, key: &str, value: u64) {
        self.set_extension(key, &value.to_string());
    }

    /// Inserts or updates a decimal tick extension.
    pub fn set_extension_tick(&mut self, key: &str, value: Tick) {
        self.set_extension(key, &value.to_string());
    }

    /// Reads a strictly-decimal `u64` extension.
    #[must_use]
    pub fn extension_u64(&self, key: &str) -> Option<u64> {
        let text = self.extension(key)?;
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok()
    }

    /// Ensures the required scale1 marker extension is present.
    pub fn ensure_scale1(&mut self) {
        self.set_extension(EXT_SCALE1_KEY, EXT_SCALE1_VALUE);
    }

    /// Ensures the agent-reconstruction RNG extension on agent capsules.
    pub fn ensure_rng_state(&mut self) {
        if self.summary.domain_kind != DomainKind::Agents as u32 {
            return;
        }
        let state = rng_state_from_seed(
            self.summary.seed_base,
            self.summary.domain_id,
            STREAM_AGENTS_RECONSTRUCT,
        );
        self.rng_state_agents = Some(state);
        self.set_extension_u64(EXT_RNG_AGENTS_RECONSTRUCT, u64::from(state));
    }
}

fn extensions_serialized_len(extensions: &[(String, String)]) -> usize {
    4 + extensions
        .iter()
        .map(|(k, v)| string_len(k) + string_len(v))
        .sum::<usize>()
}

fn header_len(stat_ids: &[&str]) -> usize {
    4 + string_len(CAPSULE_SCHEMA)
        + 8
        + 8
        + 4
        + 8
        + 4
        + 4
        + 8
        + 8
        + string_list_len(&INVARIANT_IDS)
        + string_list_len(stat_ids)
        + 4
}

fn write_header(
    w: &mut Writer,
    summary: &CapsuleSummary,
    invariant_hash: u64,
    statistic_hash: u64,
    stat_ids: &[&str],
    extension_len: usize,
) {
    w.put_u32(CAPSULE_VERSION);
    w.put_string(CAPSULE_SCHEMA);
    w.put_u64(summary.capsule_id);
    w.put_u64(summary.domain_id);
    w.put_u32(summary.domain_kind);
    w.put_i64(summary.source_tick);
    w.put_u32(summary.collapse_reason);
    w.put_u32(summary.seed_base);
    w.put_u64(invariant_hash);
    w.put_u64(statistic_hash);
    w.put_string_list(&INVARIANT_IDS);
    w.put_string_list(stat_ids);
    w.put_u32(extension_len as u32);
}

fn write_resources_payload(w: &mut Writer, entries: &[ResourceEntry]) {
    let b = resource_buckets(entries);
    w.put_u32(entries.len() as u32);
    for entry in entries {
        w.put_u64(entry.resource_id);
        w.put_u64(entry.quantity);
    }
    for bucket in b.buckets {
        w.put_u64(bucket);
    }
    w.put_u64(b.total_quantity);
}

fn write_network_payload(w: &mut Writer, nodes: &[NetworkNode], edges: &[NetworkEdge]) {
    let dist = crate::stats::wear_distribution(edges);
    w.put_u32(nodes.len() as u32);
    for node in nodes {
        w.put_u64(node.node_id);
        w.put_u32(node.node_kind);
    }
    w.put_u32(edges.len() as u32);
    for edge in edges {
        w.put_u64(edge.edge_id);
        w.put_u64(edge.from_node_id);
        w.put_u64(edge.to_node_id);
        w.put_u64(edge.capacity_units);
        w.put_u64(edge.buffer_units);
        for wear in edge.wear_buckets {
            w.put_u32(wear);
        }
    }
    for bucket in dist.buckets {
        w.put_u32(bucket);
    }
    w.put_u32(dist.mean);
    w.put_u32(dist.p95);
}

fn write_agents_payload(w: &mut Writer, agents: &[AgentEntry]) {
    let (role_trait, planning) = agent_buckets(agents);
    w.put_u32(agents.len() as u32);
    for agent in agents {
        w.put_u64(agent.agent_id);
        w.put_u32(agent.role_id);
        w.put_u32(agent.trait_mask);
        w.put_u32(agent.planning_bucket);
    }
    w.put_u32(role_trait.len() as u32);
    for b in &role_trait {
        w.put_u32(b.role_id);
        w.put_u32(b.trait_mask);
        w.put_u32(b.count);
    }
    w.put_u32(planning.len() as u32);
    for b in &planning {
        w.put_u32(b.planning_bucket);
        w.put_u32(b.count);
    }
}

fn write_extensions(w: &mut Writer, extensions: &[(String, String)]) {
    w.put_u32(extensions.len() as u32);
    for (key, value) in extensions {
        w.put_string(key);
        w.put_string(value);
    }
}

/// Result of serializing a capsule: the blob plus the hashes it records.
#[derive(Debug, Clone)]
pub struct SerializedCapsule {
    /// Serialized capsule bytes.
    pub bytes: Bytes,
    /// Invariant hash recorded in the header.
    pub invariant_hash: u64,
    /// Statistic hash recorded in the header.
    pub statistic_hash: u64,
    /// Number of invariant ids recorded.
    pub invariant_count: u32,
    /// Number of statistic ids recorded.
    pub statistic_count: u32,
}

/// Serializes a domain slot into a capsule blob.
///
/// Payload entries are sorted copies; the slot is not mutated.
pub fn serialize_capsule(
    slot: &DomainSlot,
    now_tick: Tick,
    reason_code: u32,
    capsule_id: u64,
    seed_base: u32,
) -> Result<SerializedCapsule, CodecError> {
    let kind = slot.kind();
    let stat_ids = statistic_ids(kind);

    // Sorted working copies plus the two authoritative hashes.
    let (payload, invariant_hash, statistic_hash) = match &slot.payload {
        DomainPayload::Resources(entries) => {
            let mut copy = entries.clone();
            sort_resources(&mut copy);
            let inv = resource_invariant_hash(&copy, now_tick);
            let stat = resource_statistic_hash(&copy);
            (DomainPayload::Resources(copy), inv, stat)
        }
        DomainPayload::Network { nodes, edges } => {
            let mut n = nodes.clone();
            let mut e = edges.clone();
            sort_nodes(&mut n);
            sort_edges(&mut e);
            let inv = network_invariant_hash(&n, &e, now_tick);
            let stat = network_statistic_hash(&e);
            (DomainPayload::Network { nodes: n, edges: e }, inv, stat)
        }
        DomainPayload::Agents(agents) => {
            let mut copy = agents.clone();
            sort_agents(&mut copy);
            let inv = agent_invariant_hash(copy.len() as u32, now_tick);
            let stat = agent_statistic_hash(&copy);
            (DomainPayload::Agents(copy), inv, stat)
        }
    };

    let mut extensions: Vec<(String, String)> =
        vec![(EXT_SCALE1_KEY.to_owned(), EXT_SCALE1_VALUE.to_owned())];
    if kind == DomainKind::Agents {
        let state = rng_state_from_seed(seed_base, slot.domain_id, STREAM_AGENTS_RECONSTRUCT);
        extensions.push((EXT_RNG_AGENTS_RECONSTRUCT.to_owned(), state.to_string()));
    }
    extensions.sort();
    let extension_len = extensions_serialized_len(&extensions);

    let summary = CapsuleSummary {
        capsule_id,
        domain_id: slot.domain_id,
        domain_kind: kind as u32,
        source_tick: now_tick,
        collapse_reason: reason_code,
        seed_base,
        invariant_hash,
        statistic_hash,
        invariant_count: INVARIANT_IDS.len() as u32,
        statistic_count: stat_ids.len() as u32,
    };

    let mut w = Writer::with_capacity(header_len(stat_ids) + extension_len + 256);
    write_header(
        &mut w,
        &summary,
        invariant_hash,
        statistic_hash,
        stat_ids,
        extension_len,
    );
    match &payload {
        DomainPayload::Resources(entries) => write_resources_payload(&mut w, entries),
        DomainPayload::Network { nodes, edges } => write_network_payload(&mut w, nodes, edges),
        DomainPayload::Agents(agents) => write_agents_payload(&mut w, agents),
    }
    write_extensions(&mut w, &extensions);

    Ok(SerializedCapsule {
        bytes: w.finish(),
        invariant_hash,
        statistic_hash,
        invariant_count: INVARIANT_IDS.len() as u32,
        statistic_count: stat_ids.len() as u32,
    })
}

/// Re-serializes a parsed capsule, refreshing hashes from its payload.
///
/// Used by macro execution: the caller mutates `data`'s summary and
/// extensions, then the blob is rebuilt with recomputed invariant and
/// statistic hashes at `summary.source_tick`. The required extensions are
/// (re)applied before writing.
pub fn serialize_from_data(data: &mut CapsuleData) -> Result<SerializedCapsule, CodecError> {
    let kind =
        DomainKind::from_u32(data.summary.domain_kind).ok_or(CodecError::UnknownKind(data.summary.domain_kind))?;
    let stat_ids = statistic_ids(kind);

    data.ensure_scale1();
    data.ensure_rng_state();

    let (invariant_hash, statistic_hash) = match kind {
        DomainKind::Resources => {
            sort_resources(&mut data.resources);
            (
                resource_invariant_hash(&data.resources, data.summary.source_tick),
                resource_statistic_hash(&data.resources),
            )
        }
        DomainKind::Network => {
            sort_nodes(&mut data.nodes);
            sort_edges(&mut data.edges);
            (
                network_invariant_hash(&data.nodes, &data.edges, data.summary.source_tick),
                network_statistic_hash(&data.edges),
            )
        }
        DomainKind::Agents => {
            sort_agents(&mut data.agents);
            (
                agent_invariant_hash(data.agents.len() as u32, data.summary.source_tick),
                agent_statistic_hash(&data.agents),
            )
        }
    };

    let extension_len = extensions_serialized_len(&data.extensions);
    data.summary.invariant_hash = invariant_hash;
    data.summary.statistic_hash = statistic_hash;
    data.summary.invariant_count = INVARIANT_IDS.len() as u32;
    data.summary.statistic_count = stat_ids.len() as u32;

    let mut w = Writer::with_capacity(header_len(stat_ids) + extension_len + 256);
    write_header(
        &mut w,
        &data.summary,
        invariant_hash,
        statistic_hash,
        stat_ids,
        extension_len,
    );
    match kind {
        DomainKind::Resources => write_resources_payload(&mut w, &data.resources),
        DomainKind::Network => write_network_payload(&mut w, &data.nodes, &data.edges),
        DomainKind::Agents => {
            data.agent_count = data.agents.len() as u32;
            write_agents_payload(&mut w, &data.agents);
        }
    }
    write_extensions(&mut w, &data.extensions);

    Ok(SerializedCapsule {
        bytes: w.finish(),
        invariant_hash,
        statistic_hash,
        invariant_count: INVARIANT_IDS.len() as u32,
        statistic_count: stat_ids.len() as u32,
    })
}

fn parse_extensions(data: &mut CapsuleData, bytes: &[u8]) {
    data.extension_parse_ok = false;
    if bytes.is_empty() {
        data.extension_parse_ok = true;
        return;
    }
    let mut r = Reader::new(bytes);
    let Ok(count) = r.get_u32() else { return };
    for _ in 0..count {
        let Ok(key) = r.get_string(bytes.len()) else {
            return;
        };
        if key.is_empty() {
            return;
        }
        let Ok(value) = r.get_string(bytes.len()) else {
            return;
        };
        let (key, value) = (key.to_owned(), value.to_owned());
        data.set_extension(&key, &value);
    }
    data.extension_parse_ok = r.expect_end().is_ok();
}

/// Parses a capsule blob into its full data form.
pub fn parse_capsule(bytes: &[u8]) -> Result<CapsuleData, CodecError> {
    let mut r = Reader::new(bytes);
    check_version(&mut r, CAPSULE_VERSION)?;
    let mut data = CapsuleData {
        schema: r.get_string(SCHEMA_CAP)?.to_owned(),
        ..CapsuleData::default()
    };
    data.summary.capsule_id = r.get_u64()?;
    data.summary.domain_id = r.get_u64()?;
    data.summary.domain_kind = r.get_u32()?;
    data.summary.source_tick = r.get_i64()?;
    data.summary.collapse_reason = r.get_u32()?;
    data.summary.seed_base = r.get_u32()?;
    data.summary.invariant_hash = r.get_u64()?;
    data.summary.statistic_hash = r.get_u64()?;
    data.summary.invariant_count = r.skip_string_list()?;
    data.summary.statistic_count = r.skip_string_list()?;
    let extension_len = r.get_u32()? as usize;

    let kind = DomainKind::from_u32(data.summary.domain_kind)
        .ok_or(CodecError::UnknownKind(data.summary.domain_kind))?;
    match kind {
        DomainKind::Resources => {
            let count = r.get_u32()?;
            for _ in 0..count {
                data.resources.push(ResourceEntry {
                    resource_id: r.get_u64()?,
                    quantity: r.get_u64()?,
                });
            }
            for bucket in &mut data.resource_buckets.buckets {
                *bucket = r.get_u64()?;
            }
            data.resource_buckets.total_quantity = r.get_u64()?;
            sort_resources(&mut data.resources);
        }
        DomainKind::Network => {
            let node_count = r.get_u32()?;
            for _ in 0..node_count {
                data.nodes.push(NetworkNode {
                    node_id: r.get_u64()?,
                    node_kind: r.get_u32()?,
                });
            }
            let edge_count = r.get_u32()?;
            for _ in 0..edge_count {
                let mut edge = NetworkEdge {
                    edge_id: r.get_u64()?,
                    from_node_id: r.get_u64()?,
                    to_node_id: r.get_u64()?,
                    capacity_units: r.get_u64()?,
                    buffer_units: r.get_u64()?,
                    wear_buckets: [0; 4],
                };
                for wear in &mut edge.wear_buckets {
                    *wear = r.get_u32()?;
                }
                data.edges.push(edge);
            }
            for bucket in &mut data.wear.buckets {
                *bucket = r.get_u32()?;
            }
            data.wear.mean = r.get_u32()?;
            data.wear.p95 = r.get_u32()?;
            sort_nodes(&mut data.nodes);
            sort_edges(&mut data.edges);
        }
        DomainKind::Agents => {
            let agent_count = r.get_u32()?;
            for _ in 0..agent_count {
                data.agents.push(AgentEntry {
                    agent_id: r.get_u64()?,
                    role_id: r.get_u32()?,
                    trait_mask: r.get_u32()?,
                    planning_bucket: r.get_u32()?,
                });
            }
            data.agent_count = agent_count;
            sort_agents(&mut data.agents);
            // Histograms are derivable; skip but bounds-check them.
            let role_trait_count = r.get_u32()? as usize;
            r.skip(role_trait_count * 12)?;
            let planning_count = r.get_u32()? as usize;
            r.skip(planning_count * 8)?;
        }
    }

    if extension_len > r.remaining() {
        return Err(CodecError::Wire(WireError::LengthOutOfBounds {
            len: extension_len,
            remaining: r.remaining(),
        }));
    }
    data.extension_len = extension_len as u32;
    let ext_bytes = r.get_bytes(extension_len)?;
    parse_extensions(&mut data, ext_bytes);
    if let Some(state) = data.extension_u64(EXT_RNG_AGENTS_RECONSTRUCT) {
        if state <= u64::from(u32::MAX) {
            data.rng_state_agents = Some(state as u32);
        }
    }
    Ok(data)
}

/// Parses only the summary of a capsule blob.
pub fn summarize_capsule(bytes: &[u8]) -> Result<CapsuleSummary, CodecError> {
    parse_capsule(bytes).map(|data| data.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FidelityTier;

    fn resource_slot() -> DomainSlot {
        DomainSlot::new(
            11,
            FidelityTier::Meso,
            DomainPayload::Resources(vec![
                ResourceEntry {
                    resource_id: 2,
                    quantity: 2000,
                },
                ResourceEntry {
                    resource_id: 1,
                    quantity: 5,
                },
            ]),
        )
    }

    fn agent_slot() -> DomainSlot {
        DomainSlot::new(
            12,
            FidelityTier::Meso,
            DomainPayload::Agents(vec![
                AgentEntry {
                    agent_id: 1,
                    role_id: 1,
                    trait_mask: 1,
                    planning_bucket: 2,
                },
                AgentEntry {
                    agent_id: 2,
                    role_id: 2,
                    trait_mask: 1,
                    planning_bucket: 1,
                },
            ]),
        )
    }

    #[test]
    fn serialize_parse_roundtrip_resources() {
        let slot = resource_slot();
        let sc = serialize_capsule(&slot, 10, 1, 777, 0xfeed).expect("serialize");
        let data = parse_capsule(&sc.bytes).expect("parse");
        assert_eq!(data.schema, CAPSULE_SCHEMA);
        assert_eq!(data.summary.capsule_id, 777);
        assert_eq!(data.summary.domain_id, 11);
        assert_eq!(data.summary.source_tick, 10);
        assert_eq!(data.summary.seed_base, 0xfeed);
        assert_eq!(data.summary.invariant_hash, sc.invariant_hash);
        assert_eq!(data.summary.statistic_hash, sc.statistic_hash);
        assert_eq!(data.summary.invariant_count, 6);
        assert_eq!(data.summary.statistic_count, 1);
        assert_eq!(data.resources.len(), 2);
        assert_eq!(data.resource_buckets.buckets, [1, 0, 0, 1]);
        assert_eq!(data.resource_buckets.total_quantity, 2005);
        assert!(data.extension_parse_ok);
        assert_eq!(data.extension(EXT_SCALE1_KEY), Some(EXT_SCALE1_VALUE));
    }

    #[test]
    fn agent_capsule_carries_rng_extension() {
        let slot = agent_slot();
        let seed = 0x1234_5678;
        let sc = serialize_capsule(&slot, 4, 2, 888, seed).expect("serialize");
        let data = parse_capsule(&sc.bytes).expect("parse");
        let expected = rng_state_from_seed(seed, 12, STREAM_AGENTS_RECONSTRUCT);
        assert_eq!(data.rng_state_agents, Some(expected));
        assert_eq!(
            data.extension_u64(EXT_RNG_AGENTS_RECONSTRUCT),
            Some(u64::from(expected))
        );
        assert_eq!(data.summary.statistic_count, 2);
    }

    #[test]
    fn resource_capsule_has_no_rng_extension() {
        let sc = serialize_capsule(&resource_slot(), 4, 1, 99, 7).expect("serialize");
        let data = parse_capsule(&sc.bytes).expect("parse");
        assert_eq!(data.rng_state_agents, None);
    }

    #[test]
    fn parse_rejects_unknown_version_and_kind() {
        let sc = serialize_capsule(&resource_slot(), 0, 1, 5, 0).expect("serialize");
        let mut wrong = sc.bytes.to_vec();
        wrong[3] = 2;
        assert!(matches!(
            parse_capsule(&wrong),
            Err(CodecError::Wire(WireError::UnsupportedVersion { .. }))
        ));

        // Corrupt the domain-kind field (follows version + schema + 2 u64s).
        let kind_offset = 4 + 4 + CAPSULE_SCHEMA.len() + 8 + 8;
        let mut wrong = sc.bytes.to_vec();
        wrong[kind_offset + 3] = 9;
        assert!(matches!(parse_capsule(&wrong), Err(CodecError::UnknownKind(9))));
    }

    #[test]
    fn parse_rejects_truncation() {
        let sc = serialize_capsule(&resource_slot(), 0, 1, 5, 0).expect("serialize");
        assert!(parse_capsule(&sc.bytes[..sc.bytes.len() - 3]).is_err());
    }

    #[test]
    fn serialize_from_data_preserves_roundtrip() {
        let sc = serialize_capsule(&resource_slot(), 6, 1, 42, 3).expect("serialize");
        let mut data = parse_capsule(&sc.bytes).expect("parse");
        let rebuilt = serialize_from_data(&mut data).expect("rebuild");
        let again = parse_capsule(&rebuilt.bytes).expect("reparse");
        assert_eq!(again.summary.invariant_hash, sc.invariant_hash);
        assert_eq!(again.resources, data.resources);
    }

    #[test]
    fn macro_extensions_survive_rewrite() {
        let sc = serialize_capsule(&resource_slot(), 6, 1, 42, 3).expect("serialize");
        let mut data = parse_capsule(&sc.bytes).expect("parse");
        data.summary.source_tick = 22;
        data.set_extension_tick(EXT_MACRO_LAST_TICK, 22);
        data.set_extension_u64(EXT_MACRO_EVENTS, 1);
        let rebuilt = serialize_from_data(&mut data).expect("rebuild");
        let again = parse_capsule(&rebuilt.bytes).expect("reparse");
        assert_eq!(again.summary.source_tick, 22);
        assert_eq!(again.extension_u64(EXT_MACRO_EVENTS), Some(1));
        assert_eq!(again.extension(EXT_MACRO_LAST_TICK), Some("22"));
        // Hashes were refreshed for the new source tick.
        assert_ne!(again.summary.invariant_hash, sc.invariant_hash);
        assert_eq!(again.summary.statistic_hash, sc.statistic_hash);
    }

    #[test]
    fn extension_map_stays_sorted() {
        let mut data = CapsuleData::default();
        data.set_extension("b", "2");
        data.set_extension("a", "1");
        data.set_extension("c", "3");
        data.set_extension("b", "two");
        let keys: Vec<&str> = data.extensions.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(data.extension("b"), Some("two"));
    }

    #[test]
    fn strict_decimal_extension_parse() {
        let mut data = CapsuleData::default();
        data.set_extension("n", "0042");
        data.set_extension("bad", "4x2");
        data.set_extension("empty", "");
        assert_eq!(data.extension_u64("n"), Some(42));
        assert_eq!(data.extension_u64("bad"), None);
        assert_eq!(data.extension_u64("empty"), None);
    }

    #[test]
    fn malformed_extension_block_flags_not_ok() {
        let sc = serialize_capsule(&resource_slot(), 1, 1, 9, 0).expect("serialize");
        let mut bytes = sc.bytes.to_vec();
        // Declare one more extension than the block actually holds.
        let ext_block_start = bytes.len() - sc_extension_block_len(&bytes);
        let declared = u32::from_be_bytes(
            bytes[ext_block_start..ext_block_start + 4]
                .try_into()
                .expect("4 bytes"),
        );
        bytes[ext_block_start..ext_block_start + 4].copy_from_slice(&(declared + 1).to_be_bytes());
        let data = parse_capsule(&bytes).expect("parse");
        assert!(!data.extension_parse_ok);
    }

    fn sc_extension_block_len(bytes: &[u8]) -> usize {
        // Recover the declared extension length via a fresh parse.
        parse_capsule(bytes).expect("parse").extension_len as usize
    }
}
