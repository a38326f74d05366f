use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::core::cancel::CancelToken;
use crate::core::store::DeleteError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CleanupError {
    #[error("A cleanup run is already in progress")]
    AlreadyRunning,

    #[error("Batch size must be greater than zero")]
    InvalidBatchSize,
}

/// Backing store the executor mutates.
pub trait CleanupTarget: Sync {
    type Id: Clone + Ord + Hash + Display + Send + Sync;

    fn delete(&self, id: &Self::Id) -> Result<(), DeleteError>;

    /// Re-checked right before deleting; protected items are skipped.
    fn is_protected(&self, _id: &Self::Id) -> bool {
        false
    }
}

/// Told about every id that was really deleted once a run terminates.
pub trait CleanupObserver<Id>: Send + Sync {
    fn items_deleted(&self, ids: &[Id]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The id appeared earlier in the same run.
    Duplicate,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    Pending,
    Deleted,
    Failed(DeleteError),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupProgress {
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem<Id> {
    pub id: Id,
    pub outcome: ItemOutcome,
}

/// Record of one cleanup run, frozen once the run terminates.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupBatch<Id> {
    pub run_id: Uuid,
    pub batch_size: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    items: Vec<BatchItem<Id>>,
}

impl<Id: Clone> CleanupBatch<Id> {
    fn new(ids: Vec<Id>, batch_size: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            batch_size,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            items: ids
                .into_iter()
                .map(|id| BatchItem {
                    id,
                    outcome: ItemOutcome::Pending,
                })
                .collect(),
        }
    }

    /// Items in submission order.
    pub fn items(&self) -> &[BatchItem<Id>] {
        &self.items
    }

    pub fn progress(&self) -> CleanupProgress {
        let mut progress = CleanupProgress::default();
        for item in &self.items {
            match item.outcome {
                ItemOutcome::Pending => progress.remaining += 1,
                ItemOutcome::Deleted => progress.deleted += 1,
                ItemOutcome::Failed(_) => progress.failed += 1,
                ItemOutcome::Skipped(_) => progress.skipped += 1,
            }
        }
        progress
    }

    pub fn deleted_ids(&self) -> Vec<Id> {
        self.ids_where(|outcome| outcome == ItemOutcome::Deleted)
    }

    pub fn pending_ids(&self) -> Vec<Id> {
        self.ids_where(|outcome| outcome == ItemOutcome::Pending)
    }

    /// Every failed id with the reason the store gave.
    pub fn failures(&self) -> Vec<(Id, DeleteError)> {
        self.items
            .iter()
            .filter_map(|item| match item.outcome {
                ItemOutcome::Failed(reason) => Some((item.id.clone(), reason)),
                _ => None,
            })
            .collect()
    }

    /// Ids worth submitting again: failures the store may accept later.
    /// The executor itself never retries.
    pub fn retry_candidates(&self) -> Vec<Id> {
        self.ids_where(|outcome| {
            matches!(
                outcome,
                ItemOutcome::Failed(DeleteError::Busy | DeleteError::PermissionDenied)
            )
        })
    }

    fn ids_where(&self, keep: impl Fn(ItemOutcome) -> bool) -> Vec<Id> {
        self.items
            .iter()
            .filter(|item| keep(item.outcome))
            .map(|item| item.id.clone())
            .collect()
    }
}

pub type ProgressCallback = Box<dyn Fn(&CleanupProgress) + Send + Sync>;

/// Deletes items chunk by chunk.
///
/// Items inside a chunk are deleted in parallel and the chunk always runs
/// to completion; cancellation is only honoured between chunks. Per-item
/// failures are recorded and never stop the run.
pub struct CleanupExecutor<Id> {
    status: Mutex<RunStatus>,
    cancel: CancelToken,
    observers: Vec<Arc<dyn CleanupObserver<Id>>>,
    progress_callback: Option<ProgressCallback>,
}

impl<Id> CleanupExecutor<Id>
where
    Id: Clone + Ord + Hash + Display + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            status: Mutex::new(RunStatus::Idle),
            cancel: CancelToken::new(),
            observers: Vec::new(),
            progress_callback: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CleanupObserver<Id>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn status(&self) -> RunStatus {
        *self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Requests cancellation; the chunk in flight still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn start<T>(
        &self,
        target: &T,
        ids: Vec<Id>,
        batch_size: usize,
    ) -> Result<CleanupBatch<Id>, CleanupError>
    where
        T: CleanupTarget<Id = Id>,
    {
        if batch_size == 0 {
            return Err(CleanupError::InvalidBatchSize);
        }
        {
            let mut status = self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *status == RunStatus::Running {
                return Err(CleanupError::AlreadyRunning);
            }
            // a cancel arriving once the status reads Running must stick
            self.cancel.reset();
            *status = RunStatus::Running;
        }

        let mut batch = CleanupBatch::new(ids, batch_size);
        let mut seen = HashSet::new();
        for item in batch.items.iter_mut() {
            if !seen.insert(item.id.clone()) {
                item.outcome = ItemOutcome::Skipped(SkipReason::Duplicate);
            }
        }

        log::info!(
            "Cleanup run {} started: {} items in chunks of {}",
            batch.run_id,
            batch.items.len(),
            batch_size
        );

        let total = batch.items.len();
        let mut processed = 0;
        let mut cancelled = false;
        let mut progress = CleanupProgress {
            remaining: total,
            ..CleanupProgress::default()
        };

        for chunk in batch.items.chunks_mut(batch_size) {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            chunk.par_iter_mut().for_each(|item| {
                if item.outcome != ItemOutcome::Pending {
                    return;
                }
                if target.is_protected(&item.id) {
                    item.outcome = ItemOutcome::Skipped(SkipReason::Protected);
                    return;
                }
                item.outcome = match target.delete(&item.id) {
                    Ok(()) => ItemOutcome::Deleted,
                    Err(reason) => {
                        log::warn!("Failed to delete {}: {}", item.id, reason);
                        ItemOutcome::Failed(reason)
                    }
                };
            });

            processed += chunk.len();
            for item in chunk.iter() {
                match item.outcome {
                    ItemOutcome::Deleted => progress.deleted += 1,
                    ItemOutcome::Failed(_) => progress.failed += 1,
                    ItemOutcome::Skipped(_) => progress.skipped += 1,
                    ItemOutcome::Pending => {}
                }
            }
            progress.remaining = total - processed;

            if let Some(callback) = &self.progress_callback {
                callback(&progress);
            }
        }

        batch.status = if cancelled {
            RunStatus::Cancelled
        } else if progress.deleted == 0 && progress.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        batch.finished_at = Some(Utc::now());

        let deleted = batch.deleted_ids();
        if !deleted.is_empty() {
            for observer in &self.observers {
                observer.items_deleted(&deleted);
            }
        }

        log::info!(
            "Cleanup run {} finished as {:?}: {} deleted, {} failed, {} skipped, {} pending",
            batch.run_id,
            batch.status,
            progress.deleted,
            progress.failed,
            progress.skipped,
            progress.remaining
        );

        *self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = batch.status;
        Ok(batch)
    }
}

impl<Id> Default for CleanupExecutor<Id>
where
    Id: Clone + Ord + Hash + Display + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}
