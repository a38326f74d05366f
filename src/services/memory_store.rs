use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::core::asset::{AssetHandle, AssetId};
use crate::core::store::{DeleteError, MediaStore, StoreError};

struct Entry {
    handle: AssetHandle,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<AssetId, Entry>,
    protected: HashSet<AssetId>,
    delete_failures: BTreeMap<AssetId, DeleteError>,
}

/// Media store held entirely in memory, for embedding the engine over an
/// already-loaded library and for tests.
#[derive(Default)]
pub struct MemoryMediaStore {
    inner: Mutex<Inner>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the asset, replacing any previous content under the same id.
    pub fn insert(&self, handle: AssetHandle, bytes: Vec<u8>) {
        self.lock()
            .entries
            .insert(handle.id.clone(), Entry { handle, bytes });
    }

    pub fn remove(&self, id: &AssetId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    pub fn protect(&self, id: &AssetId) {
        self.lock().protected.insert(id.clone());
    }

    pub fn unprotect(&self, id: &AssetId) {
        self.lock().protected.remove(id);
    }

    /// Every later delete of `id` fails with `error`.
    pub fn fail_deletes_with(&self, id: &AssetId, error: DeleteError) {
        self.lock().delete_failures.insert(id.clone(), error);
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MediaStore for MemoryMediaStore {
    fn list_assets(&self) -> Result<Vec<AssetHandle>, StoreError> {
        Ok(self
            .lock()
            .entries
            .values()
            .map(|entry| entry.handle.clone())
            .collect())
    }

    fn read_bytes(&self, handle: &AssetHandle, limit: u64) -> Result<Vec<u8>, StoreError> {
        let inner = self.lock();
        let entry = inner.entries.get(&handle.id).ok_or_else(|| StoreError::NotFound {
            id: handle.id.to_string(),
        })?;
        if entry.bytes.len() as u64 > limit {
            return Err(StoreError::TooLarge {
                id: handle.id.to_string(),
                limit,
            });
        }
        Ok(entry.bytes.clone())
    }

    fn delete(&self, handle: &AssetHandle) -> Result<(), DeleteError> {
        let mut inner = self.lock();
        if let Some(error) = inner.delete_failures.get(&handle.id) {
            return Err(*error);
        }
        inner
            .entries
            .remove(&handle.id)
            .map(|_| ())
            .ok_or(DeleteError::NotFound)
    }

    fn is_protected(&self, handle: &AssetHandle) -> bool {
        self.lock().protected.contains(&handle.id)
    }
}
