use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::asset::{Asset, AssetHandle, AssetId};
use crate::core::cache::FingerprintCache;
use crate::core::cancel::CancelToken;
use crate::core::cleanup::{
    CleanupBatch, CleanupError, CleanupExecutor, CleanupObserver, CleanupProgress, CleanupTarget,
    RunStatus,
};
use crate::core::cluster::{Cluster, ClusterBuilder, ClusterChange, ClusterError, ClusterId};
use crate::core::config::{ConfigError, EngineConfig};
use crate::core::events::{EngineEvent, EventBus, ScanPhase, ScanProgress};
use crate::core::extractor::{ExtractError, FingerprintExtractor, FrameHasher, PerceptualHasher};
use crate::core::index::new_index;
use crate::core::keeper::{self, ClusterView};
use crate::core::selection::{SelectionError, SelectionManager, SelectionSummary};
use crate::core::store::{DeleteError, MediaStore, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Cleanup error: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome of one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub listed: usize,
    /// Assets whose fingerprint was computed or taken from the cache.
    pub fingerprinted: usize,
    pub unreadable: Vec<(AssetId, String)>,
    /// Previously scanned assets no longer listed by the store.
    pub removed: usize,
    pub cancelled: bool,
    /// Cluster state was discarded and rebuilt from the store.
    pub rebuilt: bool,
}

struct ScanState {
    catalog: HashMap<AssetId, Asset>,
    builder: ClusterBuilder,
    /// Deleted by a cleanup since the current scan listed the store; a
    /// scan must not add these back from bytes it read earlier.
    deleted: HashSet<AssetId>,
    /// Corruption found outside a scan, waiting for a rebuild.
    corruption: Option<String>,
}

impl ScanState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            catalog: HashMap::new(),
            builder: ClusterBuilder::new(new_index(config.index), config.threshold),
            deleted: HashSet::new(),
            corruption: None,
        }
    }

    fn remove(&mut self, id: &AssetId) -> Result<Option<ClusterChange>, ClusterError> {
        let catalogued = self.catalog.remove(id).is_some();
        let change = self.builder.asset_removed(id)?;
        if catalogued != change.is_some() {
            return Err(ClusterError::IndexCorruption {
                detail: format!(
                    "{id} was {} but {}",
                    if catalogued { "catalogued" } else { "not catalogued" },
                    if change.is_some() { "clustered" } else { "not clustered" }
                ),
            });
        }
        Ok(change)
    }

    /// Every catalogued asset must be clustered, and nothing else.
    fn check_integrity(&self) -> Result<(), ClusterError> {
        self.builder.check_integrity()?;
        if let Some(id) = self.catalog.keys().find(|id| !self.builder.contains(id)) {
            return Err(ClusterError::IndexCorruption {
                detail: format!("{id} is catalogued but not clustered"),
            });
        }
        if self.catalog.len() != self.builder.asset_count() {
            return Err(ClusterError::IndexCorruption {
                detail: format!(
                    "{} assets catalogued but {} clustered",
                    self.catalog.len(),
                    self.builder.asset_count()
                ),
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops deleted assets from the catalogue and their clusters.
struct CatalogObserver {
    state: Arc<Mutex<ScanState>>,
    events: Arc<EventBus>,
}

impl CleanupObserver<AssetId> for CatalogObserver {
    fn items_deleted(&self, ids: &[AssetId]) {
        let mut changes = Vec::new();
        {
            let mut state = lock(&self.state);
            for id in ids {
                state.deleted.insert(id.clone());
                match state.remove(id) {
                    Ok(change) => changes.extend(change),
                    Err(err) => {
                        log::error!("Cluster state is corrupt after deleting {}: {}", id, err);
                        state.corruption.get_or_insert_with(|| err.to_string());
                    }
                }
            }
        }
        if !changes.is_empty() {
            self.events.publish(EngineEvent::ClustersChanged { changes });
        }
    }
}

/// Resolves asset ids to store handles for the executor.
struct MediaCleanup<'a, S> {
    store: &'a S,
    handles: HashMap<AssetId, AssetHandle>,
}

impl<S: MediaStore> CleanupTarget for MediaCleanup<'_, S> {
    type Id = AssetId;

    fn delete(&self, id: &AssetId) -> Result<(), DeleteError> {
        let handle = self.handles.get(id).ok_or(DeleteError::NotFound)?;
        self.store.delete(handle)
    }

    fn is_protected(&self, id: &AssetId) -> bool {
        self.handles
            .get(id)
            .is_some_and(|handle| self.store.is_protected(handle))
    }
}

/// Scans a media store, keeps duplicate clusters and the user's selection
/// up to date, and runs batch cleanups against the store.
///
/// All methods take `&self`; share the engine behind an `Arc` to cancel a
/// scan or cleanup from another thread.
pub struct Engine<S: MediaStore> {
    store: S,
    config: EngineConfig,
    extractor: FingerprintExtractor,
    state: Arc<Mutex<ScanState>>,
    selection: Arc<SelectionManager<AssetId>>,
    executor: CleanupExecutor<AssetId>,
    events: Arc<EventBus>,
    scan_cancel: CancelToken,
    scan_lock: Mutex<()>,
    pool: rayon::ThreadPool,
}

impl<S: MediaStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.decode_slots)
            .thread_name(|i| format!("sweeprs-worker-{i}"))
            .build()?;

        let events = Arc::new(EventBus::new());
        let state = Arc::new(Mutex::new(ScanState::new(&config)));
        let selection = Arc::new(SelectionManager::new());

        let progress_events = events.clone();
        let executor = CleanupExecutor::<AssetId>::new()
            .with_observer(Arc::new(CatalogObserver {
                state: state.clone(),
                events: events.clone(),
            }))
            .with_observer(selection.clone())
            .with_progress_callback(Box::new(move |progress: &CleanupProgress| {
                progress_events.publish(EngineEvent::CleanupProgress(*progress));
            }));

        let extractor = FingerprintExtractor::new(
            Arc::new(PerceptualHasher::new(config.hash_algorithm)),
            Arc::new(FingerprintCache::new(config.cache_capacity)),
        )
        .with_read_limit(config.max_read_bytes);

        log::debug!(
            "Engine ready: threshold={}, index={:?}, {} workers",
            config.threshold,
            config.index,
            config.decode_slots
        );

        Ok(Self {
            store,
            config,
            extractor,
            state,
            selection,
            executor,
            events,
            scan_cancel: CancelToken::new(),
            scan_lock: Mutex::new(()),
            pool,
        })
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn FrameHasher>) -> Self {
        self.extractor = FingerprintExtractor::new(hasher, self.extractor.cache().clone())
            .with_read_limit(self.config.max_read_bytes);
        self
    }

    pub fn with_cache(mut self, cache: Arc<FingerprintCache>) -> Self {
        self.extractor = FingerprintExtractor::new(self.extractor.hasher().clone(), cache)
            .with_read_limit(self.config.max_read_bytes);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        self.extractor.cache()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Brings clusters in line with the store: new and changed assets are
    /// fingerprinted and clustered, vanished ones removed. If the cluster
    /// state turns out to be inconsistent it is discarded and rebuilt.
    pub fn request_scan(&self) -> Result<ScanReport, EngineError> {
        let _scan = lock(&self.scan_lock);
        self.scan_cancel.reset();

        match self.scan_once() {
            Err(EngineError::Cluster(err)) => {
                log::error!("Cluster state is corrupt, rebuilding: {}", err);
                self.rebuild_locked()
            }
            other => other,
        }
    }

    /// Discards every cluster and scans the whole store again.
    pub fn rebuild(&self) -> Result<ScanReport, EngineError> {
        let _scan = lock(&self.scan_lock);
        self.scan_cancel.reset();
        self.rebuild_locked()
    }

    /// Stops a running scan after the chunk in flight.
    pub fn cancel_scan(&self) {
        self.scan_cancel.cancel();
    }

    fn rebuild_locked(&self) -> Result<ScanReport, EngineError> {
        let previous: Vec<AssetId> = {
            let mut state = lock(&self.state);
            let previous = state.catalog.keys().cloned().collect();
            *state = ScanState::new(&self.config);
            previous
        };

        let mut report = self.scan_once()?;

        let stale: Vec<AssetId> = {
            let state = lock(&self.state);
            previous
                .into_iter()
                .filter(|id| !state.catalog.contains_key(id))
                .collect()
        };
        self.selection.forget(&stale);
        self.publish_selection();

        report.rebuilt = true;
        self.events.publish(EngineEvent::Rebuilt);
        log::info!("Rebuilt cluster state from {} assets", report.listed);
        Ok(report)
    }

    fn scan_once(&self) -> Result<ScanReport, EngineError> {
        {
            let mut state = lock(&self.state);
            if let Some(detail) = state.corruption.take() {
                return Err(ClusterError::IndexCorruption { detail }.into());
            }
            state.deleted.clear();
        }
        self.publish_scan(ScanPhase::Listing, 0, 0, 0);

        let mut handles = self.store.list_assets()?;
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles.dedup_by(|a, b| a.id == b.id);
        let listed: HashSet<AssetId> = handles.iter().map(|h| h.id.clone()).collect();
        let protected: Vec<bool> = handles.iter().map(|h| self.store.is_protected(h)).collect();

        let mut report = ScanReport {
            listed: handles.len(),
            ..ScanReport::default()
        };
        let mut changes = Vec::new();
        let mut pending = Vec::new();

        {
            let mut state = lock(&self.state);

            let vanished: Vec<AssetId> = state
                .catalog
                .keys()
                .filter(|id| !listed.contains(*id))
                .cloned()
                .collect();
            for id in &vanished {
                changes.extend(state.remove(id)?);
                self.extractor.cache().invalidate(id);
            }
            self.selection.forget(&vanished);
            report.removed = vanished.len();

            for (handle, protected) in handles.into_iter().zip(protected) {
                if state.deleted.contains(&handle.id) {
                    continue;
                }
                match state.catalog.get_mut(&handle.id) {
                    Some(asset) if asset.handle.token == handle.token => {
                        asset.handle = handle;
                        asset.protected = protected;
                        self.selection.track(&*asset);
                    }
                    _ => pending.push((handle, protected)),
                }
            }
        }

        log::info!(
            "Scanning {} assets ({} new or changed, {} removed)",
            report.listed,
            pending.len(),
            report.removed
        );

        let total = pending.len();
        let mut processed = 0;
        let extractor = &self.extractor;
        let store = &self.store;
        let cancel = &self.scan_cancel;

        for chunk in pending.chunks(self.config.scan_chunk_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let results: Vec<Option<Result<_, ExtractError>>> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|(handle, _)| {
                        if cancel.is_cancelled() {
                            None
                        } else {
                            Some(extractor.extract(store, handle))
                        }
                    })
                    .collect()
            });

            let mut state = lock(&self.state);
            for ((handle, protected), result) in chunk.iter().zip(results) {
                let Some(result) = result else {
                    report.cancelled = true;
                    continue;
                };
                processed += 1;

                if state.deleted.contains(&handle.id) {
                    log::debug!("{} was deleted while being fingerprinted", handle.id);
                    self.extractor.cache().invalidate(&handle.id);
                    continue;
                }

                match result {
                    Ok(record) => {
                        let asset = Asset {
                            handle: handle.clone(),
                            protected: *protected,
                            record,
                        };
                        changes.extend(
                            state
                                .builder
                                .asset_added(handle.id.clone(), asset.record.fingerprint)?,
                        );
                        self.selection.track(&asset);
                        state.catalog.insert(handle.id.clone(), asset);
                        report.fingerprinted += 1;
                    }
                    Err(ExtractError::UnreadableAsset { id, reason }) => {
                        log::warn!("Skipping unreadable asset {}: {}", id, reason);
                        changes.extend(state.remove(&handle.id)?);
                        self.selection.forget([&handle.id]);
                        report.unreadable.push((handle.id.clone(), reason));
                    }
                }
            }
            drop(state);

            self.publish_scan(
                ScanPhase::Fingerprinting,
                processed,
                total,
                report.unreadable.len(),
            );
        }

        let (assets, clusters) = {
            let mut state = lock(&self.state);
            if let Some(detail) = state.corruption.take() {
                return Err(ClusterError::IndexCorruption { detail }.into());
            }
            state.check_integrity()?;
            (state.catalog.len(), state.builder.cluster_count())
        };

        if !changes.is_empty() {
            self.events.publish(EngineEvent::ClustersChanged { changes });
        }
        self.publish_scan(
            ScanPhase::Complete,
            processed,
            total,
            report.unreadable.len(),
        );
        self.events.publish(EngineEvent::ScanFinished {
            assets,
            clusters,
            cancelled: report.cancelled,
        });
        self.publish_selection();

        let stats = self.extractor.cache().stats();
        log::info!(
            "Scan finished: {} assets in {} clusters, {} unreadable, cache {} hits / {} misses{}",
            assets,
            clusters,
            report.unreadable.len(),
            stats.hits,
            stats.misses,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Verifies that every catalogued asset sits in exactly one cluster and
    /// the similarity index agrees with the clusters.
    pub fn check_integrity(&self) -> Result<(), EngineError> {
        Ok(lock(&self.state).check_integrity()?)
    }

    /// Every cluster, singletons included, in creation order.
    pub fn clusters(&self) -> Vec<Cluster> {
        lock(&self.state).builder.clusters()
    }

    pub fn cluster_of(&self, id: &AssetId) -> Option<Cluster> {
        lock(&self.state).builder.cluster_of(id)
    }

    pub fn asset(&self, id: &AssetId) -> Option<Asset> {
        lock(&self.state).catalog.get(id).cloned()
    }

    /// Clusters with at least two members, with keeper and savings.
    pub fn cluster_views(&self) -> Vec<ClusterView> {
        let state = lock(&self.state);
        state
            .builder
            .clusters()
            .into_iter()
            .filter(Cluster::has_duplicates)
            .filter_map(|cluster| keeper::describe(&cluster, &state.catalog))
            .collect()
    }

    pub fn cluster_view(&self, id: ClusterId) -> Option<ClusterView> {
        let state = lock(&self.state);
        state
            .builder
            .cluster(id)
            .and_then(|cluster| keeper::describe(&cluster, &state.catalog))
    }

    pub fn toggle(&self, id: &AssetId) -> Result<bool, EngineError> {
        let selected = self.selection.toggle(id)?;
        self.publish_selection();
        Ok(selected)
    }

    /// Selects every non-protected member of the cluster.
    pub fn select_all_in_cluster(&self, cluster: ClusterId) -> Result<usize, EngineError> {
        let members = self.members_of(cluster)?;
        let added = self.selection.select_all_in(&members);
        self.publish_selection();
        Ok(added)
    }

    pub fn deselect_all_in_cluster(&self, cluster: ClusterId) -> Result<usize, EngineError> {
        let members = self.members_of(cluster)?;
        let removed = self.selection.deselect_all_in(&members);
        self.publish_selection();
        Ok(removed)
    }

    /// Selects everything in the cluster except its recommended keeper.
    pub fn select_duplicates_in_cluster(&self, cluster: ClusterId) -> Result<usize, EngineError> {
        let view = self
            .cluster_view(cluster)
            .ok_or(EngineError::UnknownCluster(cluster))?;
        let added = self
            .selection
            .select_all_in(&keeper::deletable_duplicates(&view));
        self.publish_selection();
        Ok(added)
    }

    pub fn select_all_duplicates(&self) -> usize {
        let duplicates: Vec<AssetId> = self
            .cluster_views()
            .iter()
            .flat_map(keeper::deletable_duplicates)
            .collect();
        let added = self.selection.select_all_in(&duplicates);
        self.publish_selection();
        added
    }

    pub fn clear_selection(&self) {
        self.selection.clear();
        self.publish_selection();
    }

    pub fn is_selected(&self, id: &AssetId) -> bool {
        self.selection.is_selected(id)
    }

    pub fn selected_ids(&self) -> Vec<AssetId> {
        self.selection.selected_ids().into_iter().collect()
    }

    pub fn summary(&self) -> SelectionSummary {
        self.selection.summary()
    }

    /// Deletes `ids` in chunks of `batch_size` (the configured size when
    /// `None`). Deleted assets leave their clusters and the selection;
    /// failed ones stay where they were.
    pub fn request_cleanup(
        &self,
        ids: Vec<AssetId>,
        batch_size: Option<usize>,
    ) -> Result<CleanupBatch<AssetId>, EngineError> {
        let batch_size = batch_size.unwrap_or(self.config.batch_size);
        let handles = {
            let state = lock(&self.state);
            ids.iter()
                .filter_map(|id| state.catalog.get(id))
                .map(|asset| (asset.id().clone(), asset.handle.clone()))
                .collect()
        };
        let target = MediaCleanup {
            store: &self.store,
            handles,
        };

        let executor = &self.executor;
        let batch = self
            .pool
            .install(|| executor.start(&target, ids, batch_size))?;

        self.events.publish(EngineEvent::CleanupFinished {
            run_id: batch.run_id,
            status: batch.status,
            deleted: batch.deleted_ids().len(),
            failed: batch.failures(),
        });
        self.publish_selection();
        self.rebuild_if_corrupt();
        Ok(batch)
    }

    /// Rebuilds when removing deleted assets found the cluster state
    /// corrupt. A scan in progress picks the corruption up itself.
    fn rebuild_if_corrupt(&self) {
        if lock(&self.state).corruption.is_none() {
            return;
        }
        let _scan = match self.scan_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                log::warn!("Cluster state is corrupt; the running scan will rebuild it");
                return;
            }
        };
        self.scan_cancel.reset();
        if let Err(err) = self.rebuild_locked() {
            log::error!("Rebuild after cleanup failed: {}", err);
        }
    }

    pub fn cleanup_selected(
        &self,
        batch_size: Option<usize>,
    ) -> Result<CleanupBatch<AssetId>, EngineError> {
        self.request_cleanup(self.selected_ids(), batch_size)
    }

    /// Stops a running cleanup once the chunk in flight has finished.
    pub fn cancel_cleanup(&self) {
        self.executor.cancel();
    }

    pub fn cleanup_status(&self) -> RunStatus {
        self.executor.status()
    }

    fn members_of(&self, cluster: ClusterId) -> Result<Vec<AssetId>, EngineError> {
        lock(&self.state)
            .builder
            .cluster(cluster)
            .map(|c| c.members.into_iter().collect())
            .ok_or(EngineError::UnknownCluster(cluster))
    }

    fn publish_scan(&self, phase: ScanPhase, processed: usize, total: usize, unreadable: usize) {
        self.events.publish(EngineEvent::ScanProgress(ScanProgress {
            phase,
            processed,
            total,
            unreadable,
        }));
    }

    fn publish_selection(&self) {
        self.events
            .publish(EngineEvent::SelectionChanged(self.selection.summary()));
    }
}
