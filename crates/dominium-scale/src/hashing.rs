// SPDX-License-Identifier: Apache-2.0
//! FNV-1a hashing and identifier derivation.
//!
//! Every hash that crosses a wire or a save boundary in this workspace is
//! FNV-1a 64 over big-endian field encodings. The constants below are the
//! contract: changing either the offset basis or the prime is a breaking
//! change to every capsule, container, and replay comparison.

use crate::domain::Tick;

/// FNV-1a 64 offset basis.
pub const FNV64_INIT: u64 = 0xcbf29ce484222325;
/// FNV-1a 64 prime.
pub const FNV64_PRIME: u64 = 0x100000001b3;

/// FNV-1a 32 offset basis (stream-name hashing only).
pub const FNV32_INIT: u32 = 0x811c9dc5;
/// FNV-1a 32 prime.
pub const FNV32_PRIME: u32 = 0x01000193;

/// Domain separator mixed into every commit-token nonce ("SCALE-01").
const COMMIT_NONCE_TAG: u64 = 0x5343414c452d3031;

/// Feeds `bytes` through FNV-1a 64, continuing from `hash`.
#[must_use]
pub fn fnv1a64(mut hash: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

/// Mixes a `u32` into `hash` as four big-endian bytes.
#[must_use]
pub fn hash_u32(hash: u64, value: u32) -> u64 {
    fnv1a64(hash, &value.to_be_bytes())
}

/// Mixes a `u64` into `hash` as eight big-endian bytes.
#[must_use]
pub fn hash_u64(hash: u64, value: u64) -> u64 {
    fnv1a64(hash, &value.to_be_bytes())
}

/// Mixes a tick into `hash` through its two's-complement `u64` image.
#[must_use]
pub fn hash_tick(hash: u64, value: Tick) -> u64 {
    hash_u64(hash, value as u64)
}

/// Mixes a `u64` into `hash` through its eight little-endian bytes.
///
/// Log and runtime hashes fold whole records value-by-value with this mix;
/// the byte order differs from the big-endian field feeds above and both
/// are frozen.
#[must_use]
pub fn mix_u64(hash: u64, value: u64) -> u64 {
    fnv1a64(hash, &value.to_le_bytes())
}

/// FNV-1a 32 over a string, used for RNG stream-name folding.
#[must_use]
pub fn fnv1a32_str(text: &str) -> u32 {
    let mut hash = FNV32_INIT;
    for b in text.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// Folds a `u64` to 32 bits by xoring its halves.
#[must_use]
pub fn fold_u64(value: u64) -> u32 {
    ((value >> 32) ^ (value & 0xFFFF_FFFF)) as u32
}

/// Hashes a raw byte blob from the offset basis. Used for capsule-blob
/// fingerprints reported in operation results.
#[must_use]
pub fn blob_hash(bytes: &[u8]) -> u64 {
    fnv1a64(FNV64_INIT, bytes)
}

/// Derives the capsule id for a collapse of `domain_id` at `tick`.
#[must_use]
pub fn capsule_id(domain_id: u64, domain_kind: u32, tick: Tick, reason_code: u32) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u64(hash, domain_id);
    hash = hash_u32(hash, domain_kind);
    hash = hash_tick(hash, tick);
    hash_u32(hash, reason_code)
}

/// Derives the 32-bit seed base stored in a capsule header.
///
/// `capsule_id XOR tick` pushed through a 64-bit avalanche finalizer
/// (xor-shift 33, multiply, xor-shift 33), truncated to 32 bits.
#[must_use]
pub fn seed_base(capsule_id: u64, tick: Tick) -> u32 {
    let mut mix = capsule_id ^ (tick as u64);
    mix ^= mix >> 33;
    mix = mix.wrapping_mul(0xff51afd7ed558ccd);
    mix ^= mix >> 33;
    (mix & 0xFFFF_FFFF) as u32
}

/// Derives the nonce of a commit token for `tick`.
#[must_use]
pub fn commit_nonce(tick: Tick) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u64(hash, COMMIT_NONCE_TAG);
    hash_tick(hash, tick)
}

/// Derives the ordering-key seed of a macro schedule.
#[must_use]
pub fn macro_order_seed(capsule_id: u64, domain_id: u64, domain_kind: u32, reason: u32) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u64(hash, capsule_id);
    hash = hash_u64(hash, domain_id);
    hash = hash_u32(hash, domain_kind);
    hash_u32(hash, reason)
}

/// Derives a macro event id. Zero is reserved, so a zero hash maps to 1.
#[must_use]
pub fn macro_event_id(
    domain_id: u64,
    capsule_id: u64,
    event_tick: Tick,
    event_index: u32,
    event_kind: u32,
) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u64(hash, domain_id);
    hash = hash_u64(hash, capsule_id);
    hash = hash_tick(hash, event_tick);
    hash = hash_u32(hash, event_index);
    hash = hash_u32(hash, event_kind);
    if hash == 0 {
        1
    } else {
        hash
    }
}

/// Derives a macro event ordering key from the schedule seed.
#[must_use]
pub fn macro_order_key(seed: u64, event_index: u32, event_kind: u32) -> u64 {
    let mut hash = FNV64_INIT;
    hash = hash_u64(hash, seed);
    hash = hash_u32(hash, event_index);
    hash_u32(hash, event_kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv64_matches_reference_vector() {
        // FNV-1a 64 of "a" is a published reference value.
        assert_eq!(fnv1a64(FNV64_INIT, b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(FNV64_INIT, b""), FNV64_INIT);
    }

    #[test]
    fn field_feeds_are_big_endian() {
        let via_u32 = hash_u32(FNV64_INIT, 0x0102_0304);
        let via_bytes = fnv1a64(FNV64_INIT, &[1, 2, 3, 4]);
        assert_eq!(via_u32, via_bytes);
    }

    #[test]
    fn capsule_ids_separate_inputs() {
        let a = capsule_id(7, 1, 10, 1);
        assert_ne!(a, capsule_id(8, 1, 10, 1));
        assert_ne!(a, capsule_id(7, 2, 10, 1));
        assert_ne!(a, capsule_id(7, 1, 11, 1));
        assert_ne!(a, capsule_id(7, 1, 10, 2));
    }

    #[test]
    fn commit_nonce_is_tick_stable() {
        assert_eq!(commit_nonce(42), commit_nonce(42));
        assert_ne!(commit_nonce(42), commit_nonce(43));
    }

    #[test]
    fn event_id_never_zero() {
        // No realistic input hits zero, but the guard must hold for all.
        assert_ne!(macro_event_id(0, 0, 0, 0, 0), 0);
    }

    #[test]
    fn seed_base_truncates_to_32_bits() {
        let seed = seed_base(u64::MAX, i64::MAX);
        assert_eq!(u64::from(seed) & 0xFFFF_FFFF_0000_0000, 0);
    }
}
