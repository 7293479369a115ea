// SPDX-License-Identifier: Apache-2.0
//! Shard lifecycle state machine and its transition log.

use dominium_scale::hashing::{mix_u64, FNV64_INIT};
use dominium_scale::Tick;

use crate::protocol::ShardId;

/// Lifecycle state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LifecycleState {
    /// Booting; not yet serving.
    Initializing = 1,
    /// Serving intents.
    Active = 2,
    /// Serving while shedding load.
    Draining = 3,
    /// State held, not serving.
    Frozen = 4,
    /// Gone.
    Offline = 5,
}

impl LifecycleState {
    /// Decodes a wire value; unknown values return `None`.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Initializing),
            2 => Some(Self::Active),
            3 => Some(Self::Draining),
            4 => Some(Self::Frozen),
            5 => Some(Self::Offline),
            _ => None,
        }
    }

    /// Stable display name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Active => "ACTIVE",
            Self::Draining => "DRAINING",
            Self::Frozen => "FROZEN",
            Self::Offline => "OFFLINE",
        }
    }
}

/// Whether `from -> to` is a legal transition. Self-loops are no-ops and
/// always allowed.
#[must_use]
pub fn transition_allowed(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState as L;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (L::Initializing, L::Active | L::Frozen | L::Offline)
            | (L::Active, L::Draining | L::Frozen | L::Offline)
            | (L::Draining, L::Active | L::Frozen | L::Offline)
            | (L::Frozen, L::Initializing | L::Active | L::Offline)
            | (L::Offline, L::Initializing | L::Frozen)
    )
}

/// One logged transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEntry {
    /// Shard that transitioned.
    pub shard_id: ShardId,
    /// Tick of the transition.
    pub tick: Tick,
    /// State before.
    pub from_state: LifecycleState,
    /// State after.
    pub to_state: LifecycleState,
    /// Caller-supplied reason code.
    pub reason_code: u32,
}

/// Ring-capped transition log with an overflow counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleLog {
    entries: Vec<LifecycleEntry>,
    capacity: usize,
    overflow: u32,
}

/// Error returned for a transition the diagram forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lifecycle transition {from:?} -> {to:?} is not allowed")]
pub struct TransitionError {
    /// State before.
    pub from: LifecycleState,
    /// State after.
    pub to: LifecycleState,
}

impl LifecycleLog {
    /// Creates a log holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            capacity,
            overflow: 0,
        }
    }

    /// Logged transitions in order.
    #[must_use]
    pub fn entries(&self) -> &[LifecycleEntry] {
        &self.entries
    }

    /// Entries dropped on overflow.
    #[must_use]
    pub fn overflow(&self) -> u32 {
        self.overflow
    }

    /// Drops all entries and resets the overflow counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.overflow = 0;
    }

    /// Restores the log from a checkpoint copy.
    pub fn restore(&mut self, entries: &[LifecycleEntry], overflow: u32) {
        self.entries.clear();
        self.entries.extend_from_slice(entries);
        self.overflow = overflow;
    }

    /// Validates and logs a transition. A full log still validates but
    /// counts the entry as overflow.
    pub fn log_transition(
        &mut self,
        shard_id: ShardId,
        tick: Tick,
        from: LifecycleState,
        to: LifecycleState,
        reason_code: u32,
    ) -> Result<(), TransitionError> {
        if !transition_allowed(from, to) {
            return Err(TransitionError { from, to });
        }
        if self.capacity == 0 || self.entries.len() >= self.capacity {
            self.overflow += 1;
            return Ok(());
        }
        self.entries.push(LifecycleEntry {
            shard_id,
            tick,
            from_state: from,
            to_state: to,
            reason_code,
        });
        Ok(())
    }

    /// Deterministic hash over count, capacity, overflow, and entries.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hash = FNV64_INIT;
        hash = mix_u64(hash, self.entries.len() as u64);
        hash = mix_u64(hash, self.capacity as u64);
        hash = mix_u64(hash, u64::from(self.overflow));
        for e in &self.entries {
            hash = mix_u64(hash, u64::from(e.shard_id));
            hash = mix_u64(hash, e.tick as u64);
            hash = mix_u64(hash, u64::from(e.from_state as u32));
            hash = mix_u64(hash, u64::from(e.to_state as u32));
            hash = mix_u64(hash, u64::from(e.reason_code));
        }
        hash
    }
}
