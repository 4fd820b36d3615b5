use std::collections::HashMap;
use std::hash::Hash;

use crate::domain::{CellKey, Region, SpeciesCode};

pub type CellSpeciesKey = (CellKey, SpeciesCode);
pub type RegionSpeciesKey = (Region, SpeciesCode);

/// Count table owned by a single ingestion pass. Nothing here locks: the
/// writer holds `&mut self`, and `snapshot` consumes the table once ingestion
/// is over.
#[derive(Debug, Clone)]
pub struct CountTable<K> {
    counts: HashMap<K, u64>,
}

impl<K: Eq + Hash + Ord> CountTable<K> {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }

    pub fn increment(&mut self, key: K) {
        self.add(key, 1);
    }

    /// Adds a pre-counted observation total, as returned by facet queries.
    pub fn add(&mut self, key: K, n: u64) {
        let slot = self.counts.entry(key).or_insert(0);
        *slot = slot.saturating_add(n);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<u64> {
        self.counts.get(key).copied()
    }

    /// Freezes the table into `(key, count)` pairs ordered by key.
    pub fn snapshot(self) -> Vec<(K, u64)> {
        let mut entries: Vec<(K, u64)> = self.counts.into_iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl<K: Eq + Hash + Ord> Default for CountTable<K> {
    fn default() -> Self {
        Self::new()
    }
}
