//! Interval tracking store for alias records.
//!
//! The store is a plain ordered map from a record's key (the page-aligned
//! start of its still-virtual window) to the record. It performs no
//! syscalls and has no locking of its own: the engine serializes every call.

use crate::addr::AddrRange;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Metadata for a byte range whose contents are still borrowed from another buffer.
///
/// `owner` and `origin` fix a translation: the byte the application sees at
/// `owner + k` must eventually equal the byte at `origin + k` as it was when
/// the alias was created. `fringe` and `len` select the window of that
/// translation that is still virtual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasRecord {
    /// Start of the range the application sees.
    pub owner: usize,
    /// Address the owner's bytes are copied from while unmaterialized.
    pub origin: usize,
    /// Bytes still unmaterialized.
    pub len: usize,
    /// Bytes at the front of `owner` that are not covered by this record.
    pub fringe: usize,
}

impl AliasRecord {
    /// A pending destination copy of `origin` into `owner`.
    pub fn alias(owner: usize, origin: usize, fringe: usize, len: usize) -> Self {
        Self { owner, origin, len, fringe }
    }

    /// A buffer write-protected on behalf of the aliases reading from it.
    pub fn true_origin(window: AddrRange) -> Self {
        Self {
            owner: window.start,
            origin: window.start,
            len: window.len,
            fringe: 0,
        }
    }

    /// Lookup coordinate: the first virtual byte.
    pub fn key(&self) -> usize {
        self.owner + self.fringe
    }

    /// The range that is still virtual (missing or write-protected).
    pub fn window(&self) -> AddrRange {
        AddrRange::new(self.key(), self.len)
    }

    pub fn is_true_origin(&self) -> bool {
        self.owner == self.origin
    }

    /// Where the byte at `addr` (inside the owner range) must be read from.
    pub fn translate(&self, addr: usize) -> usize {
        self.origin + (addr - self.owner)
    }

    /// The bytes of the origin the virtual window still depends on.
    pub fn origin_window(&self) -> AddrRange {
        AddrRange::new(self.translate(self.key()), self.len)
    }
}

/// Ordered collection of [`AliasRecord`]s keyed by [`AliasRecord::key`].
#[derive(Debug, Default)]
pub struct AliasStore {
    records: BTreeMap<usize, AliasRecord>,
}

impl AliasStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record under its key, returning any record it displaced.
    pub fn insert(&mut self, record: AliasRecord) -> Option<AliasRecord> {
        debug_assert!(record.len > 0, "empty alias record {record:?}");
        self.records.insert(record.key(), record)
    }

    /// The record whose key is exactly `key`.
    pub fn lookup_exact(&self, key: usize) -> Option<&AliasRecord> {
        self.records.get(&key)
    }

    /// The record whose virtual window covers `addr`.
    pub fn lookup_containing(&self, addr: usize) -> Option<&AliasRecord> {
        self.records
            .range(..=addr)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.window().contains(addr))
    }

    pub fn delete(&mut self, key: usize) -> Option<AliasRecord> {
        self.records.remove(&key)
    }

    /// First record in address order.
    pub fn front(&self) -> Option<&AliasRecord> {
        self.records.values().next()
    }

    /// The record following the one keyed `key`.
    pub fn next(&self, key: usize) -> Option<&AliasRecord> {
        self.records
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, record)| record)
    }

    /// First record whose key is at or above `addr`.
    pub fn first_at_or_after(&self, addr: usize) -> Option<&AliasRecord> {
        self.records.range(addr..).next().map(|(_, record)| record)
    }

    /// First alias (not a true origin) whose key lies above `addr`.
    pub fn first_alias_after(&self, addr: usize) -> Option<&AliasRecord> {
        self.records
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .map(|(_, record)| record)
            .find(|record| !record.is_true_origin())
    }

    pub fn iter(&self) -> impl Iterator<Item = &AliasRecord> {
        self.records.values()
    }

    /// Keys of every record whose window overlaps `range`, in address order.
    pub fn overlapping(&self, range: AddrRange) -> Vec<usize> {
        let mut keys = Vec::new();
        if range.is_empty() {
            return keys;
        }
        if let Some(record) = self.lookup_containing(range.start) {
            keys.push(record.key());
        }
        keys.extend(self.records.range(range.start..range.end()).map(|(&key, _)| key));
        keys.dedup();
        keys
    }

    /// Keys of every alias whose origin window overlaps `origin`.
    pub fn dependents_of(&self, origin: AddrRange) -> Vec<usize> {
        let mut keys = Vec::new();
        let mut cursor = self.front();
        while let Some(record) = cursor {
            if !record.is_true_origin() && record.origin_window().overlaps(&origin) {
                keys.push(record.key());
            }
            cursor = self.next(record.key());
        }
        keys
    }
}
