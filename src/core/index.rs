use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::core::asset::AssetId;
use crate::core::config::IndexKind;
use crate::core::fingerprint::Fingerprint;

/// Neighbour lookup over fingerprints.
///
/// Callers serialise mutations behind their own lock, so a `neighbors`
/// call always observes every `insert`/`remove` that completed before it.
pub trait SimilarityIndex: Send {
    /// Inserts or replaces the fingerprint stored for `id`.
    fn insert(&mut self, id: AssetId, fingerprint: Fingerprint);

    /// Returns whether `id` was present.
    fn remove(&mut self, id: &AssetId) -> bool;

    /// Every stored id whose fingerprint is within `threshold` bits.
    fn neighbors(&self, fingerprint: &Fingerprint, threshold: u32) -> BTreeSet<AssetId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: &AssetId) -> bool;
}

pub fn new_index(kind: IndexKind) -> Box<dyn SimilarityIndex> {
    match kind {
        IndexKind::Banded => Box::new(BandedIndex::new()),
        IndexKind::Linear => Box::new(LinearIndex::new()),
    }
}

/// Reference implementation: compares against every stored fingerprint.
#[derive(Debug, Default)]
pub struct LinearIndex {
    entries: BTreeMap<AssetId, Fingerprint>,
}

impl LinearIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimilarityIndex for LinearIndex {
    fn insert(&mut self, id: AssetId, fingerprint: Fingerprint) {
        self.entries.insert(id, fingerprint);
    }

    fn remove(&mut self, id: &AssetId) -> bool {
        self.entries.remove(id).is_some()
    }

    fn neighbors(&self, fingerprint: &Fingerprint, threshold: u32) -> BTreeSet<AssetId> {
        self.entries
            .iter()
            .filter(|(_, candidate)| candidate.distance(fingerprint) <= threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, id: &AssetId) -> bool {
        self.entries.contains_key(id)
    }
}

/// Multi-index hashing over the eight bytes of a fingerprint.
///
/// Two fingerprints that differ in at most seven bits must agree exactly on
/// at least one of the eight bands, so for thresholds below
/// [`Fingerprint::BANDS`] only ids sharing a band value are compared.
/// Larger thresholds fall back to a full scan.
#[derive(Debug)]
pub struct BandedIndex {
    fingerprints: HashMap<AssetId, Fingerprint>,
    bands: Vec<HashMap<u8, HashSet<AssetId>>>,
}

impl BandedIndex {
    pub fn new() -> Self {
        Self {
            fingerprints: HashMap::new(),
            bands: (0..Fingerprint::BANDS).map(|_| HashMap::new()).collect(),
        }
    }

    fn unlink(&mut self, id: &AssetId, fingerprint: &Fingerprint) {
        for (band, buckets) in self.bands.iter_mut().enumerate() {
            let key = fingerprint.band(band);
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.remove(id);
                if bucket.is_empty() {
                    buckets.remove(&key);
                }
            }
        }
    }
}

impl Default for BandedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SimilarityIndex for BandedIndex {
    fn insert(&mut self, id: AssetId, fingerprint: Fingerprint) {
        if let Some(previous) = self.fingerprints.insert(id.clone(), fingerprint) {
            self.unlink(&id, &previous);
        }
        for (band, buckets) in self.bands.iter_mut().enumerate() {
            buckets
                .entry(fingerprint.band(band))
                .or_default()
                .insert(id.clone());
        }
    }

    fn remove(&mut self, id: &AssetId) -> bool {
        match self.fingerprints.remove(id) {
            Some(fingerprint) => {
                self.unlink(id, &fingerprint);
                true
            }
            None => false,
        }
    }

    fn neighbors(&self, fingerprint: &Fingerprint, threshold: u32) -> BTreeSet<AssetId> {
        let within = |id: &AssetId| {
            self.fingerprints
                .get(id)
                .is_some_and(|candidate| candidate.distance(fingerprint) <= threshold)
        };

        if threshold as usize >= Fingerprint::BANDS {
            return self
                .fingerprints
                .keys()
                .filter(|id| within(id))
                .cloned()
                .collect();
        }

        let mut found = BTreeSet::new();
        for (band, buckets) in self.bands.iter().enumerate() {
            let Some(bucket) = buckets.get(&fingerprint.band(band)) else {
                continue;
            };
            for id in bucket {
                if !found.contains(id) && within(id) {
                    found.insert(id.clone());
                }
            }
        }
        found
    }

    fn len(&self) -> usize {
        self.fingerprints.len()
    }

    fn contains(&self, id: &AssetId) -> bool {
        self.fingerprints.contains_key(id)
    }
}
