use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::asset::AssetHandle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Asset not found: {id}")]
    NotFound { id: String },

    #[error("Permission denied: {id}")]
    PermissionDenied { id: String },

    #[error("Asset {id} is larger than the {limit} byte read limit")]
    TooLarge { id: String, limit: u64 },

    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Why the backing store refused to delete an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum DeleteError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("store busy")]
    Busy,
}

impl From<&std::io::Error> for DeleteError {
    fn from(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DeleteError::NotFound,
            std::io::ErrorKind::PermissionDenied => DeleteError::PermissionDenied,
            _ => DeleteError::Busy,
        }
    }
}

/// Device media library the engine scans and mutates.
///
/// Implementations must be shareable across the extraction and deletion
/// worker threads.
pub trait MediaStore: Send + Sync {
    fn list_assets(&self) -> Result<Vec<AssetHandle>, StoreError>;

    /// Reads the asset's content. Reads never buffer more than `limit`
    /// bytes; larger content fails with [`StoreError::TooLarge`].
    fn read_bytes(&self, handle: &AssetHandle, limit: u64) -> Result<Vec<u8>, StoreError>;

    fn delete(&self, handle: &AssetHandle) -> Result<(), DeleteError>;

    fn is_protected(&self, handle: &AssetHandle) -> bool;
}

impl<S: MediaStore + ?Sized> MediaStore for std::sync::Arc<S> {
    fn list_assets(&self) -> Result<Vec<AssetHandle>, StoreError> {
        (**self).list_assets()
    }

    fn read_bytes(&self, handle: &AssetHandle, limit: u64) -> Result<Vec<u8>, StoreError> {
        (**self).read_bytes(handle, limit)
    }

    fn delete(&self, handle: &AssetHandle) -> Result<(), DeleteError> {
        (**self).delete(handle)
    }

    fn is_protected(&self, handle: &AssetHandle) -> bool {
        (**self).is_protected(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_io_errors_map_to_delete_reasons() {
        assert_eq!(
            DeleteError::from(&Error::from(ErrorKind::NotFound)),
            DeleteError::NotFound
        );
        assert_eq!(
            DeleteError::from(&Error::from(ErrorKind::PermissionDenied)),
            DeleteError::PermissionDenied
        );
        assert_eq!(
            DeleteError::from(&Error::from(ErrorKind::WouldBlock)),
            DeleteError::Busy
        );
    }
}
