use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

use crate::core::asset::AssetId;
use crate::core::fingerprint::Fingerprint;
use crate::core::index::SimilarityIndex;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Index corruption: {detail}")]
    IndexCorruption { detail: String },
}

fn corruption(detail: impl Into<String>) -> ClusterError {
    ClusterError::IndexCorruption {
        detail: detail.into(),
    }
}

/// Cluster identifiers are handed out in creation order and never reused,
/// so the lowest id of a set of clusters is the earliest created one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(u64);

impl ClusterId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster_{:04}", self.0)
    }
}

/// Immutable snapshot of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub members: BTreeSet<AssetId>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Clusters always have at least one member; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// A singleton cluster means no duplicate was found for its asset.
    pub fn has_duplicates(&self) -> bool {
        self.members.len() > 1
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.members.contains(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ClusterChange {
    Created {
        cluster: ClusterId,
        asset: AssetId,
    },
    Joined {
        cluster: ClusterId,
        asset: AssetId,
        absorbed: Vec<ClusterId>,
    },
    Left {
        cluster: ClusterId,
        asset: AssetId,
    },
    Dissolved {
        cluster: ClusterId,
        asset: AssetId,
    },
}

/// Incremental single-link clustering over a similarity index.
///
/// Clusters live in an arena keyed by [`ClusterId`]; every asset keeps a
/// back-reference to its cluster, and merges rewrite those references.
/// Removing an asset never splits its cluster, so links through a removed
/// asset persist until the builder is rebuilt.
pub struct ClusterBuilder {
    threshold: u32,
    index: Box<dyn SimilarityIndex>,
    clusters: BTreeMap<ClusterId, BTreeSet<AssetId>>,
    membership: HashMap<AssetId, ClusterId>,
    next_id: u64,
}

impl ClusterBuilder {
    pub fn new(index: Box<dyn SimilarityIndex>, threshold: u32) -> Self {
        Self {
            threshold,
            index,
            clusters: BTreeMap::new(),
            membership: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Adds (or re-adds with a new fingerprint) one asset and links it to
    /// every cluster holding a neighbour within the threshold. When the
    /// neighbours span several clusters they are all merged into the
    /// earliest created one.
    pub fn asset_added(
        &mut self,
        id: AssetId,
        fingerprint: Fingerprint,
    ) -> Result<Vec<ClusterChange>, ClusterError> {
        let mut changes = Vec::new();
        if self.membership.contains_key(&id) {
            changes.extend(self.asset_removed(&id)?);
        }

        let mut touched = BTreeSet::new();
        for neighbor in self.index.neighbors(&fingerprint, self.threshold) {
            let cluster = self.membership.get(&neighbor).ok_or_else(|| {
                corruption(format!("indexed asset {neighbor} belongs to no cluster"))
            })?;
            touched.insert(*cluster);
        }
        if let Some(missing) = touched.iter().find(|c| !self.clusters.contains_key(c)) {
            return Err(corruption(format!("{missing} is referenced but does not exist")));
        }

        self.index.insert(id.clone(), fingerprint);

        let change = match touched.pop_first() {
            None => {
                let cluster = ClusterId(self.next_id);
                self.next_id += 1;
                self.clusters
                    .insert(cluster, BTreeSet::from([id.clone()]));
                self.membership.insert(id.clone(), cluster);
                ClusterChange::Created { cluster, asset: id }
            }
            Some(target) => {
                let absorbed: Vec<ClusterId> = touched.into_iter().collect();
                let mut moved = BTreeSet::new();
                for other in &absorbed {
                    if let Some(members) = self.clusters.remove(other) {
                        moved.extend(members);
                    }
                }
                for member in &moved {
                    self.membership.insert(member.clone(), target);
                }
                self.membership.insert(id.clone(), target);

                let members = self
                    .clusters
                    .get_mut(&target)
                    .ok_or_else(|| corruption(format!("{target} vanished during merge")))?;
                members.extend(moved);
                members.insert(id.clone());

                ClusterChange::Joined {
                    cluster: target,
                    asset: id,
                    absorbed,
                }
            }
        };

        changes.push(change);
        Ok(changes)
    }

    /// Drops an asset from the index and its cluster. Returns `None` when
    /// the asset was not clustered. A back-reference to a missing cluster,
    /// or to one that does not list the asset, is left in place and
    /// reported as corruption.
    pub fn asset_removed(&mut self, id: &AssetId) -> Result<Option<ClusterChange>, ClusterError> {
        let Some(cluster) = self.membership.get(id).copied() else {
            self.index.remove(id);
            return Ok(None);
        };
        let members = self.clusters.get_mut(&cluster).ok_or_else(|| {
            corruption(format!("{id} belongs to {cluster}, which does not exist"))
        })?;
        if !members.remove(id) {
            return Err(corruption(format!("{id} belongs to {cluster} but is not listed")));
        }

        self.index.remove(id);
        self.membership.remove(id);
        let change = if members.is_empty() {
            self.clusters.remove(&cluster);
            ClusterChange::Dissolved {
                cluster,
                asset: id.clone(),
            }
        } else {
            ClusterChange::Left {
                cluster,
                asset: id.clone(),
            }
        };
        Ok(Some(change))
    }

    /// All clusters in creation order.
    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters
            .iter()
            .map(|(id, members)| Cluster {
                id: *id,
                members: members.clone(),
            })
            .collect()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.clusters.get(&id).map(|members| Cluster {
            id,
            members: members.clone(),
        })
    }

    pub fn cluster_of(&self, id: &AssetId) -> Option<Cluster> {
        self.membership
            .get(id)
            .and_then(|cluster| self.cluster(*cluster))
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.membership.contains_key(id)
    }

    pub fn asset_count(&self) -> usize {
        self.membership.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Verifies that clusters partition the clustered assets and that the
    /// index holds exactly those assets.
    pub fn check_integrity(&self) -> Result<(), ClusterError> {
        let mut seen = 0usize;
        for (cluster, members) in &self.clusters {
            if members.is_empty() {
                return Err(corruption(format!("{cluster} is empty")));
            }
            for member in members {
                match self.membership.get(member) {
                    Some(owner) if owner == cluster => {}
                    Some(owner) => {
                        return Err(corruption(format!(
                            "{member} listed in {cluster} but owned by {owner}"
                        )));
                    }
                    None => {
                        return Err(corruption(format!(
                            "{member} listed in {cluster} but has no owner"
                        )));
                    }
                }
                if !self.index.contains(member) {
                    return Err(corruption(format!("{member} is missing from the index")));
                }
            }
            seen += members.len();
        }

        if seen != self.membership.len() {
            return Err(corruption(format!(
                "{} assets have a cluster but clusters hold {}",
                self.membership.len(),
                seen
            )));
        }
        if self.index.len() != self.membership.len() {
            return Err(corruption(format!(
                "index holds {} fingerprints for {} clustered assets",
                self.index.len(),
                self.membership.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::IndexKind;
    use crate::core::index::new_index;

    fn builder(threshold: u32) -> ClusterBuilder {
        ClusterBuilder::new(new_index(IndexKind::Banded), threshold)
    }

    fn add(builder: &mut ClusterBuilder, id: &str, bits: u64) -> Vec<ClusterChange> {
        builder
            .asset_added(AssetId::new(id), Fingerprint::from_bits(bits))
            .unwrap()
    }

    fn groups(builder: &ClusterBuilder) -> BTreeSet<BTreeSet<AssetId>> {
        builder.clusters().into_iter().map(|c| c.members).collect()
    }

    #[test]
    fn test_single_link_chains_through_middle_asset() {
        // d(A,B)=2, d(B,C)=2, d(A,C)=4 with T=3
        let mut b = builder(3);
        add(&mut b, "A", 0b0000);
        add(&mut b, "B", 0b0011);
        add(&mut b, "C", 0b1111);
        add(&mut b, "D", u64::MAX);

        let a = b.cluster_of(&AssetId::new("A")).unwrap();
        assert_eq!(a, b.cluster_of(&AssetId::new("C")).unwrap());
        assert_eq!(a.len(), 3);
        assert!(!b.cluster_of(&AssetId::new("D")).unwrap().has_duplicates());
        b.check_integrity().unwrap();
    }

    #[test]
    fn test_bridge_merges_into_earliest_cluster() {
        let mut b = builder(2);
        add(&mut b, "left", 0b0000_0000);
        add(&mut b, "right", 0b1111_0000);
        assert_eq!(b.cluster_count(), 2);

        // two bits from each side
        let changes = add(&mut b, "bridge", 0b1100_0000);
        assert_eq!(
            changes,
            vec![ClusterChange::Joined {
                cluster: ClusterId(0),
                asset: AssetId::new("bridge"),
                absorbed: vec![ClusterId(1)],
            }]
        );
        assert_eq!(b.cluster_count(), 1);
        assert_eq!(b.cluster_of(&AssetId::new("right")).unwrap().id, ClusterId(0));
        b.check_integrity().unwrap();
    }

    #[test]
    fn test_removal_keeps_cluster_loose_and_dissolves_empty() {
        let mut b = builder(2);
        add(&mut b, "a", 0b00);
        add(&mut b, "b", 0b11);
        add(&mut b, "c", 0b1111);

        // b linked a and c; removing it does not split the cluster
        assert!(matches!(
            b.asset_removed(&AssetId::new("b")),
            Ok(Some(ClusterChange::Left { .. }))
        ));
        assert_eq!(
            b.cluster_of(&AssetId::new("a")),
            b.cluster_of(&AssetId::new("c"))
        );

        b.asset_removed(&AssetId::new("a")).unwrap();
        assert!(matches!(
            b.asset_removed(&AssetId::new("c")),
            Ok(Some(ClusterChange::Dissolved { .. }))
        ));
        assert_eq!(b.cluster_count(), 0);
        assert!(b.asset_removed(&AssetId::new("c")).unwrap().is_none());
        b.check_integrity().unwrap();
    }

    #[test]
    fn test_readd_with_new_fingerprint_moves_asset() {
        let mut b = builder(1);
        add(&mut b, "a", 0);
        add(&mut b, "b", 1);
        add(&mut b, "far", u64::MAX);

        let changes = add(&mut b, "b", u64::MAX - 1);
        assert!(matches!(changes[0], ClusterChange::Left { .. }));
        assert_eq!(
            b.cluster_of(&AssetId::new("b")),
            b.cluster_of(&AssetId::new("far"))
        );
        assert_eq!(b.asset_count(), 3);
        b.check_integrity().unwrap();
    }

    #[test]
    fn test_grouping_is_independent_of_insert_order() {
        let items = [("a", 0u64), ("b", 0b11), ("c", 0xf0), ("d", 0xf3), ("e", 0b1111)];

        let mut forward = builder(2);
        for (id, bits) in items {
            add(&mut forward, id, bits);
        }
        let mut backward = builder(2);
        for (id, bits) in items.iter().rev() {
            add(&mut backward, id, *bits);
        }

        assert_eq!(groups(&forward), groups(&backward));
    }

    #[test]
    fn test_same_input_yields_identical_clusters() {
        let items = [("a", 0u64), ("b", 0b1), ("c", 0xff00), ("d", 0xff01)];
        let run = || {
            let mut b = builder(1);
            for (id, bits) in items {
                add(&mut b, id, bits);
            }
            b.clusters()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_integrity_check_detects_double_membership() {
        let mut b = builder(0);
        add(&mut b, "a", 1);
        add(&mut b, "b", 2);
        b.clusters
            .get_mut(&ClusterId(1))
            .unwrap()
            .insert(AssetId::new("a"));

        assert!(matches!(
            b.check_integrity(),
            Err(ClusterError::IndexCorruption { .. })
        ));
    }

    #[test]
    fn test_dangling_index_entry_is_reported_on_insert() {
        let mut b = builder(4);
        add(&mut b, "a", 0);
        b.membership.remove(&AssetId::new("a"));

        let err = b
            .asset_added(AssetId::new("b"), Fingerprint::from_bits(1))
            .unwrap_err();
        assert!(err.to_string().contains("belongs to no cluster"));
    }

    #[test]
    fn test_removal_through_missing_cluster_is_reported() {
        let mut b = builder(0);
        add(&mut b, "a", 1);
        add(&mut b, "b", 2);
        b.clusters.remove(&ClusterId(0));

        let err = b.asset_removed(&AssetId::new("a")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        // the dangling reference survives for the integrity check to see
        assert!(b.contains(&AssetId::new("a")));
        assert!(b.check_integrity().is_err());
    }
}
