use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::asset::AssetId;
use crate::core::cleanup::{CleanupProgress, RunStatus};
use crate::core::cluster::ClusterChange;
use crate::core::selection::SelectionSummary;
use crate::core::store::DeleteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    Listing,
    Fingerprinting,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub processed: usize,
    pub total: usize,
    pub unreadable: usize,
}

/// Notifications pushed to subscribers. Each event is an owned snapshot;
/// subscribers decide when to act on them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ScanProgress(ScanProgress),
    ScanFinished {
        assets: usize,
        clusters: usize,
        cancelled: bool,
    },
    ClustersChanged {
        changes: Vec<ClusterChange>,
    },
    SelectionChanged(SelectionSummary),
    CleanupProgress(CleanupProgress),
    CleanupFinished {
        run_id: Uuid,
        status: RunStatus,
        deleted: usize,
        failed: Vec<(AssetId, DeleteError)>,
    },
    /// Cluster state was discarded after an integrity failure and rebuilt.
    Rebuilt,
}

/// Fan-out of engine events onto unbounded channels.
///
/// Publishing never blocks; subscribers whose receiver was dropped are
/// pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<EngineEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(EngineEvent::Rebuilt);

        assert_eq!(first.try_recv().unwrap(), EngineEvent::Rebuilt);
        assert_eq!(second.try_recv().unwrap(), EngineEvent::Rebuilt);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(EngineEvent::SelectionChanged(SelectionSummary::default()));
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
