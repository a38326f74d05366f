// Which member of a duplicate cluster to keep, and how the cluster is
// presented to callers.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::core::asset::{Asset, AssetId};
use crate::core::cluster::{Cluster, ClusterId};
use crate::core::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DuplicateType {
    /// Every member has byte-identical content.
    Exact,
    /// Members are perceptually similar.
    Similar,
    /// Single member, no duplicate found.
    Unique,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub id: ClusterId,
    pub kind: DuplicateType,
    pub members: Vec<Asset>,
    pub recommended_keep: AssetId,
    /// 1.0 for identical fingerprints, falling with the largest distance
    /// between the keeper and any other member.
    pub similarity_score: f64,
    /// Bytes freed by deleting every non-protected member except the keeper.
    pub reclaimable_bytes: u64,
}

fn rank(asset: &Asset) -> (bool, u64, u64, Reverse<i64>) {
    (
        asset.protected,
        asset.resolution(),
        asset.handle.byte_size,
        Reverse(
            asset
                .handle
                .captured_at
                .map(|t| t.timestamp())
                .unwrap_or(i64::MAX),
        ),
    )
}

/// Prefers a protected member (it stays anyway), then the highest
/// resolution, the largest file, the earliest capture, the lowest id.
pub fn recommend_keep(members: &[Asset]) -> Option<&Asset> {
    members.iter().max_by(|a, b| {
        rank(a)
            .cmp(&rank(b))
            .then_with(|| b.id().cmp(a.id()))
    })
}

pub fn describe(cluster: &Cluster, catalog: &HashMap<AssetId, Asset>) -> Option<ClusterView> {
    let members: Vec<Asset> = cluster
        .members
        .iter()
        .filter_map(|id| catalog.get(id).cloned())
        .collect();
    let keeper = recommend_keep(&members)?.clone();

    let kind = if members.len() == 1 {
        DuplicateType::Unique
    } else if members.iter().all(|m| m.record.digest == keeper.record.digest) {
        DuplicateType::Exact
    } else {
        DuplicateType::Similar
    };

    let max_distance = members
        .iter()
        .map(|m| m.record.fingerprint.distance(&keeper.record.fingerprint))
        .max()
        .unwrap_or(0);
    let reclaimable_bytes = members
        .iter()
        .filter(|m| m.id() != keeper.id() && !m.protected)
        .map(|m| m.handle.byte_size)
        .sum();

    Some(ClusterView {
        id: cluster.id,
        kind,
        recommended_keep: keeper.id().clone(),
        similarity_score: 1.0 - max_distance as f64 / Fingerprint::BITS as f64,
        reclaimable_bytes,
        members,
    })
}

/// Members that can be deleted while keeping the recommended one.
pub fn deletable_duplicates(view: &ClusterView) -> Vec<AssetId> {
    view.members
        .iter()
        .filter(|m| m.id() != &view.recommended_keep && !m.protected)
        .map(|m| m.id().clone())
        .collect()
}
