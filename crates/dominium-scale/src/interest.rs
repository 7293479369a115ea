// SPDX-License-Identifier: Apache-2.0
//! Interest states and the hysteresis policy that drives tier targets.
//!
//! An external interest set reports a strength per region; the engine
//! advances each domain's relevance state (LATENT / WARM / HOT) under a
//! hysteresis policy so states do not flap at the thresholds, then maps
//! the state to a target fidelity tier.

use crate::domain::{FidelityTier, Tick};

/// Low interest strength.
pub const STRENGTH_LOW: u32 = 64;
/// Medium interest strength.
pub const STRENGTH_MED: u32 = 128;
/// High interest strength.
pub const STRENGTH_HIGH: u32 = 192;

/// Relevance state of a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RelevanceState {
    /// Nobody cares; the domain may stay latent.
    #[default]
    Latent = 0,
    /// Peripheral interest; intermediate detail wanted.
    Warm = 1,
    /// Direct interest; full detail required.
    Hot = 2,
}

impl RelevanceState {
    /// Target fidelity tier for a relevance state.
    #[must_use]
    pub fn target_tier(self) -> FidelityTier {
        match self {
            Self::Hot => FidelityTier::Micro,
            Self::Warm => FidelityTier::Meso,
            Self::Latent => FidelityTier::Latent,
        }
    }
}

/// Hysteresis thresholds. Enter thresholds sit above the matching exit
/// thresholds so a state is only left once strength clearly falls away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestPolicy {
    /// Strength at or above which LATENT becomes WARM.
    pub enter_warm: u32,
    /// Strength below which WARM falls back to LATENT.
    pub exit_warm: u32,
    /// Strength at or above which WARM becomes HOT.
    pub enter_hot: u32,
    /// Strength below which HOT falls back to WARM.
    pub exit_hot: u32,
    /// Minimum ticks between state changes of one target.
    pub min_dwell_ticks: Tick,
}

impl Default for InterestPolicy {
    fn default() -> Self {
        Self {
            enter_warm: STRENGTH_LOW,
            exit_warm: STRENGTH_LOW / 2,
            enter_hot: STRENGTH_HIGH,
            exit_hot: STRENGTH_MED,
            min_dwell_ticks: 4,
        }
    }
}

/// Tracked interest state for one target (domain).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestState {
    /// Target (domain) id.
    pub target_id: u64,
    /// Current relevance state.
    pub state: RelevanceState,
    /// Tick of the last state change.
    pub last_change_tick: Tick,
}

/// One sampled interest strength for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestSample {
    /// Target (domain) id.
    pub target_id: u64,
    /// Sampled strength, 0..=255.
    pub strength: u32,
}

/// A batch of interest samples. Targets not present sample at strength 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestSet {
    /// Samples, in any order.
    pub samples: Vec<InterestSample>,
}

impl InterestSet {
    /// Strength for `target_id`, defaulting to 0.
    #[must_use]
    pub fn strength(&self, target_id: u64) -> u32 {
        self.samples
            .iter()
            .find(|s| s.target_id == target_id)
            .map_or(0, |s| s.strength)
    }
}

/// One observed state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestTransition {
    /// Target (domain) id.
    pub target_id: u64,
    /// State before the change.
    pub from_state: RelevanceState,
    /// State after the change.
    pub to_state: RelevanceState,
}

fn next_state(policy: &InterestPolicy, current: RelevanceState, strength: u32) -> RelevanceState {
    match current {
        RelevanceState::Latent => {
            if strength >= policy.enter_hot {
                RelevanceState::Hot
            } else if strength >= policy.enter_warm {
                RelevanceState::Warm
            } else {
                RelevanceState::Latent
            }
        }
        RelevanceState::Warm => {
            if strength >= policy.enter_hot {
                RelevanceState::Hot
            } else if strength < policy.exit_warm {
                RelevanceState::Latent
            } else {
                RelevanceState::Warm
            }
        }
        RelevanceState::Hot => {
            if strength < policy.exit_warm {
                RelevanceState::Latent
            } else if strength < policy.exit_hot {
                RelevanceState::Warm
            } else {
                RelevanceState::Hot
            }
        }
    }
}

/// Advances every tracked state against the sampled strengths.
///
/// States inside their dwell window do not change. Returns the observed
/// transitions sorted by `(target_id, to_state, from_state)` so replay
/// order is implementation-independent.
pub fn apply_interest_set(
    states: &mut [InterestState],
    interest: &InterestSet,
    policy: &InterestPolicy,
    now_tick: Tick,
) -> Vec<InterestTransition> {
    let mut transitions = Vec::new();
    for state in states.iter_mut() {
        if policy.min_dwell_ticks > 0 {
            let elapsed = (now_tick - state.last_change_tick).max(0);
            if elapsed < policy.min_dwell_ticks && state.last_change_tick != now_tick {
                continue;
            }
        }
        let strength = interest.strength(state.target_id);
        let to = next_state(policy, state.state, strength);
        if to != state.state {
            transitions.push(InterestTransition {
                target_id: state.target_id,
                from_state: state.state,
                to_state: to,
            });
            state.state = to;
            state.last_change_tick = now_tick;
        }
    }
    transitions.sort_by_key(|t| (t.target_id, t.to_state as u32, t.from_state as u32));
    transitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(ids: &[u64]) -> Vec<InterestState> {
        ids.iter()
            .map(|id| InterestState {
                target_id: *id,
                state: RelevanceState::Latent,
                last_change_tick: -100,
            })
            .collect()
    }

    fn set(pairs: &[(u64, u32)]) -> InterestSet {
        InterestSet {
            samples: pairs
                .iter()
                .map(|(id, s)| InterestSample {
                    target_id: *id,
                    strength: *s,
                })
                .collect(),
        }
    }

    #[test]
    fn enter_and_exit_use_different_thresholds() {
        let policy = InterestPolicy {
            min_dwell_ticks: 0,
            ..InterestPolicy::default()
        };
        let mut st = states(&[1]);
        apply_interest_set(&mut st, &set(&[(1, STRENGTH_LOW)]), &policy, 0);
        assert_eq!(st[0].state, RelevanceState::Warm);
        // Just below enter_warm but above exit_warm: stays warm.
        apply_interest_set(&mut st, &set(&[(1, STRENGTH_LOW - 1)]), &policy, 1);
        assert_eq!(st[0].state, RelevanceState::Warm);
        // Below exit_warm: falls back.
        apply_interest_set(&mut st, &set(&[(1, STRENGTH_LOW / 2 - 1)]), &policy, 2);
        assert_eq!(st[0].state, RelevanceState::Latent);
    }

    #[test]
    fn hot_requires_high_strength() {
        let policy = InterestPolicy {
            min_dwell_ticks: 0,
            ..InterestPolicy::default()
        };
        let mut st = states(&[1]);
        apply_interest_set(&mut st, &set(&[(1, STRENGTH_HIGH)]), &policy, 0);
        assert_eq!(st[0].state, RelevanceState::Hot);
        // Drops to medium: falls to warm, not latent.
        apply_interest_set(&mut st, &set(&[(1, STRENGTH_MED - 1)]), &policy, 1);
        assert_eq!(st[0].state, RelevanceState::Warm);
    }

    #[test]
    fn dwell_blocks_rapid_flapping() {
        let policy = InterestPolicy::default();
        let mut st = states(&[1]);
        st[0].last_change_tick = 0;
        st[0].state = RelevanceState::Warm;
        let tr = apply_interest_set(&mut st, &set(&[]), &policy, 2);
        assert!(tr.is_empty());
        let tr = apply_interest_set(&mut st, &set(&[]), &policy, 4);
        assert_eq!(tr.len(), 1);
        assert_eq!(st[0].state, RelevanceState::Latent);
    }

    #[test]
    fn transitions_sorted_by_target_then_states() {
        let policy = InterestPolicy {
            min_dwell_ticks: 0,
            ..InterestPolicy::default()
        };
        let mut st = states(&[9, 3, 5]);
        let tr = apply_interest_set(
            &mut st,
            &set(&[(9, STRENGTH_HIGH), (3, STRENGTH_LOW), (5, STRENGTH_HIGH)]),
            &policy,
            0,
        );
        let ids: Vec<u64> = tr.iter().map(|t| t.target_id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn state_maps_to_target_tier() {
        assert_eq!(RelevanceState::Hot.target_tier(), FidelityTier::Micro);
        assert_eq!(RelevanceState::Warm.target_tier(), FidelityTier::Meso);
        assert_eq!(RelevanceState::Latent.target_tier(), FidelityTier::Latent);
    }
}
