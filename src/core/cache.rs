use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::core::asset::{AssetId, ContentToken};
use crate::core::extractor::FingerprintRecord;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    id: AssetId,
    token: ContentToken,
    record: FingerprintRecord,
}

struct Slot {
    token: ContentToken,
    record: FingerprintRecord,
}

/// Fingerprint cache keyed by asset id and content-change token.
///
/// Owned by whoever builds the engine and injected into the extractor, so it
/// can be preloaded from disk and saved after a scan. Bounded by entry count;
/// the least recently used entry is evicted first.
pub struct FingerprintCache {
    slots: Mutex<LruCache<AssetId, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FingerprintCache {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached record only if it was computed for `token`.
    /// A stale entry for an older token is dropped.
    pub fn get(&self, id: &AssetId, token: &ContentToken) -> Option<FingerprintRecord> {
        let mut slots = self.lock();
        let lookup = slots
            .get(id)
            .map(|slot| (&slot.token == token).then(|| slot.record.clone()));
        let record = match lookup {
            Some(Some(record)) => Some(record),
            Some(None) => {
                slots.pop(id);
                None
            }
            None => None,
        };

        let counter = if record.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        record
    }

    pub fn insert(&self, id: AssetId, token: ContentToken, record: FingerprintRecord) {
        self.lock().put(id, Slot { token, record });
    }

    pub fn invalidate(&self, id: &AssetId) {
        self.lock().pop(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Loads a cache previously written by [`FingerprintCache::save`].
    /// A missing file yields an empty cache.
    pub fn load(path: &Path, capacity: usize) -> Result<Self, CacheError> {
        let cache = Self::new(capacity);
        if !path.exists() {
            return Ok(cache);
        }

        let reader = BufReader::new(fs::File::open(path)?);
        let entries: Vec<CacheEntry> = serde_json::from_reader(reader)?;
        for entry in entries {
            cache.insert(entry.id, entry.token, entry.record);
        }
        log::debug!("Loaded {} cached fingerprints from {}", cache.len(), path.display());
        Ok(cache)
    }

    /// Writes entries oldest first so a reload keeps the eviction order.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let entries: Vec<CacheEntry> = self
            .lock()
            .iter()
            .rev()
            .map(|(id, slot)| CacheEntry {
                id: id.clone(),
                token: slot.token.clone(),
                record: slot.record.clone(),
            })
            .collect();

        let writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(writer, &entries)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<AssetId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::Fingerprint;
    use tempfile::TempDir;

    fn record(bits: u64) -> FingerprintRecord {
        FingerprintRecord {
            fingerprint: Fingerprint::from_bits(bits),
            digest: format!("{:064x}", bits),
            width: 4,
            height: 4,
        }
    }

    #[test]
    fn test_token_change_is_a_miss() {
        let cache = FingerprintCache::new(8);
        let id = AssetId::new("a");
        cache.insert(id.clone(), ContentToken::new("v1"), record(1));

        assert_eq!(cache.get(&id, &ContentToken::new("v1")), Some(record(1)));
        assert_eq!(cache.get(&id, &ContentToken::new("v2")), None);
        // stale entry was dropped
        assert_eq!(cache.get(&id, &ContentToken::new("v1")), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = FingerprintCache::new(2);
        let token = ContentToken::new("t");
        cache.insert(AssetId::new("a"), token.clone(), record(1));
        cache.insert(AssetId::new("b"), token.clone(), record(2));

        // touch "a" so "b" becomes the eviction candidate
        assert!(cache.get(&AssetId::new("a"), &token).is_some());
        cache.insert(AssetId::new("c"), token.clone(), record(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&AssetId::new("a"), &token).is_some());
        assert!(cache.get(&AssetId::new("b"), &token).is_none());
        assert!(cache.get(&AssetId::new("c"), &token).is_some());
    }

    #[test]
    fn test_save_and_load_preserves_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");

        let cache = FingerprintCache::new(16);
        cache.insert(AssetId::new("x"), ContentToken::new("1"), record(7));
        cache.insert(AssetId::new("y"), ContentToken::new("2"), record(9));
        cache.save(&path).unwrap();

        let loaded = FingerprintCache::load(&path, 16).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(&AssetId::new("y"), &ContentToken::new("2")),
            Some(record(9))
        );
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FingerprintCache::load(&temp_dir.path().join("none.json"), 4).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reload_keeps_eviction_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        let token = ContentToken::new("t");

        let cache = FingerprintCache::new(3);
        cache.insert(AssetId::new("a"), token.clone(), record(1));
        cache.insert(AssetId::new("b"), token.clone(), record(2));
        cache.insert(AssetId::new("c"), token.clone(), record(3));
        // "a" becomes the most recent, "b" the oldest
        assert!(cache.get(&AssetId::new("a"), &token).is_some());
        cache.save(&path).unwrap();

        let loaded = FingerprintCache::load(&path, 3).unwrap();
        assert_eq!(loaded.capacity(), 3);
        loaded.insert(AssetId::new("d"), token.clone(), record(4));
        assert!(loaded.get(&AssetId::new("b"), &token).is_none());
        assert!(loaded.get(&AssetId::new("a"), &token).is_some());
        assert!(loaded.get(&AssetId::new("c"), &token).is_some());
    }
}
