//! Groups near-duplicate photos and videos by perceptual fingerprint and
//! deletes the ones a user selects in safe, cancellable batches.

pub mod core;
pub mod services;

pub use crate::core::asset::{Asset, AssetHandle, AssetId, AssetKind, ContentToken};
pub use crate::core::cache::FingerprintCache;
pub use crate::core::cleanup::{CleanupBatch, ItemOutcome, RunStatus};
pub use crate::core::cluster::{Cluster, ClusterId};
pub use crate::core::config::EngineConfig;
pub use crate::core::engine::{Engine, EngineError, ScanReport};
pub use crate::core::events::EngineEvent;
pub use crate::core::keeper::{ClusterView, DuplicateType};
pub use crate::core::store::{DeleteError, MediaStore, StoreError};
