// SPDX-License-Identifier: Apache-2.0
//! Capsule blob store: binary capsules keyed and sorted by capsule id.
//!
//! Blobs are owned by the store; readers get borrowed views with the
//! store's lifetime. Insertion preserves sort order so every traversal is
//! identical across runs.

use bytes::Bytes;
use thiserror::Error;

use crate::domain::Tick;
use crate::wire::{check_version, Reader, WireError, Writer};

/// Container format version.
pub const CAPSULE_STORE_VERSION: u32 = 1;

/// Errors raised by the capsule store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Capsule id 0 is reserved for "never collapsed".
    #[error("capsule id 0 is reserved")]
    ZeroId,
    /// Wire-level decode failure.
    #[error("container decode failed: {0}")]
    Wire(#[from] WireError),
}

/// One stored capsule blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleRecord {
    /// Capsule id, unique within the store.
    pub capsule_id: u64,
    /// Domain the capsule was produced from.
    pub domain_id: u64,
    /// Tick the capsule content is current as of.
    pub source_tick: Tick,
    /// Serialized capsule bytes.
    pub bytes: Bytes,
}

/// Sorted capsule blob store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapsuleStore {
    records: Vec<CapsuleRecord>,
}

impl CapsuleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, capsule_id: u64) -> Result<usize, usize> {
        self.records
            .binary_search_by(|r| r.capsule_id.cmp(&capsule_id))
    }

    /// Inserts or replaces the blob for `capsule_id`.
    pub fn set_blob(
        &mut self,
        capsule_id: u64,
        domain_id: u64,
        source_tick: Tick,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        if capsule_id == 0 {
            return Err(StoreError::ZeroId);
        }
        let record = CapsuleRecord {
            capsule_id,
            domain_id,
            source_tick,
            bytes: Bytes::copy_from_slice(bytes),
        };
        match self.index_of(capsule_id) {
            Ok(idx) => self.records[idx] = record,
            Err(idx) => self.records.insert(idx, record),
        }
        Ok(())
    }

    /// Borrows the record for `capsule_id`.
    #[must_use]
    pub fn get_blob(&self, capsule_id: u64) -> Option<&CapsuleRecord> {
        self.index_of(capsule_id).ok().map(|idx| &self.records[idx])
    }

    /// Borrows the record at sorted position `index`.
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&CapsuleRecord> {
        self.records.get(index)
    }

    /// Number of stored capsules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Serializes the store.
    ///
    /// Layout: `u32 version, u32 count, [u64 capsule_id, u64 domain_id,
    /// i64 source_tick, u32 byte_count, bytes]*`, big-endian.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let payload: usize = self.records.iter().map(|r| 28 + r.bytes.len()).sum();
        let mut w = Writer::with_capacity(8 + payload);
        w.put_u32(CAPSULE_STORE_VERSION);
        w.put_u32(self.records.len() as u32);
        for record in &self.records {
            w.put_u64(record.capsule_id);
            w.put_u64(record.domain_id);
            w.put_i64(record.source_tick);
            w.put_u32(record.bytes.len() as u32);
            w.put_bytes(&record.bytes);
        }
        w.finish()
    }

    /// Rebuilds a store from serialized bytes, rejecting truncated or
    /// trailing input and unknown versions.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(bytes);
        check_version(&mut r, CAPSULE_STORE_VERSION)?;
        let count = r.get_u32()?;
        let mut store = Self::new();
        for _ in 0..count {
            let capsule_id = r.get_u64()?;
            let domain_id = r.get_u64()?;
            let source_tick = r.get_i64()?;
            let byte_count = r.get_u32()? as usize;
            let blob = r.get_bytes(byte_count)?;
            store.set_blob(capsule_id, domain_id, source_tick, blob)?;
        }
        r.expect_end()?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> CapsuleStore {
        let mut store = CapsuleStore::new();
        store.set_blob(30, 3, 5, b"ccc").expect("set");
        store.set_blob(10, 1, 5, b"aaa").expect("set");
        store.set_blob(20, 2, 6, b"bb").expect("set");
        store
    }

    #[test]
    fn records_stay_sorted_by_capsule_id() {
        let store = seeded();
        let ids: Vec<u64> = (0..store.len())
            .map(|i| store.get_by_index(i).expect("index").capsule_id)
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn set_blob_replaces_in_place() {
        let mut store = seeded();
        store.set_blob(20, 2, 9, b"replaced").expect("set");
        assert_eq!(store.len(), 3);
        let rec = store.get_blob(20).expect("get");
        assert_eq!(&rec.bytes[..], b"replaced");
        assert_eq!(rec.source_tick, 9);
    }

    #[test]
    fn zero_id_is_rejected() {
        let mut store = CapsuleStore::new();
        assert_eq!(store.set_blob(0, 1, 0, b"x"), Err(StoreError::ZeroId));
    }

    #[test]
    fn serialize_roundtrip() {
        let store = seeded();
        let bytes = store.serialize();
        let back = CapsuleStore::deserialize(&bytes).expect("deserialize");
        assert_eq!(store, back);
    }

    #[test]
    fn deserialize_rejects_trailing_bytes() {
        let mut bytes = seeded().serialize().to_vec();
        bytes.push(0);
        assert!(matches!(
            CapsuleStore::deserialize(&bytes),
            Err(StoreError::Wire(WireError::TrailingBytes(1)))
        ));
    }

    #[test]
    fn deserialize_rejects_truncation_and_bad_version() {
        let bytes = seeded().serialize();
        assert!(CapsuleStore::deserialize(&bytes[..bytes.len() - 2]).is_err());
        let mut wrong = bytes.to_vec();
        wrong[3] = 9;
        assert!(matches!(
            CapsuleStore::deserialize(&wrong),
            Err(StoreError::Wire(WireError::UnsupportedVersion { .. }))
        ));
    }

    #[test]
    fn clear_drops_everything() {
        let mut store = seeded();
        store.clear();
        assert!(store.is_empty());
        assert!(store.get_blob(10).is_none());
    }
}
