use image::{GenericImageView, ImageReader};
use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

use crate::core::asset::{AssetHandle, AssetKind};
use crate::core::cache::FingerprintCache;
use crate::core::config::HashAlgorithm;
use crate::core::fingerprint::Fingerprint;
use crate::core::store::MediaStore;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Unreadable asset {id}: {reason}")]
    UnreadableAsset { id: String, reason: String },
}

/// Result of fingerprinting one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: Fingerprint,
    /// blake3 digest of the raw bytes, hex encoded; equal digests mean
    /// byte-identical copies.
    pub digest: String,
    pub width: u32,
    pub height: u32,
}

/// Perceptual hash and dimensions of one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHash {
    pub fingerprint: Fingerprint,
    pub width: u32,
    pub height: u32,
}

/// Decodes raw asset bytes and hashes the result.
///
/// Decoded pixel data must not outlive the call.
pub trait FrameHasher: Send + Sync {
    /// Whether this hasher can decode `kind` at all. Unsupported assets are
    /// rejected before any bytes are read.
    fn supports(&self, _kind: AssetKind) -> bool {
        true
    }

    fn hash_frame(&self, kind: AssetKind, bytes: &[u8]) -> Result<FrameHash, String>;
}

/// Still-image hasher built on the `image` decoders and `image_hasher`.
/// Videos are rejected as an unsupported codec.
pub struct PerceptualHasher {
    hasher: image_hasher::Hasher,
}

impl PerceptualHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let alg = match algorithm {
            HashAlgorithm::Mean => HashAlg::Mean,
            HashAlgorithm::Gradient => HashAlg::Gradient,
            HashAlgorithm::VertGradient => HashAlg::VertGradient,
            HashAlgorithm::Blockhash => HashAlg::Blockhash,
        };
        let hasher = HasherConfig::new().hash_size(8, 8).hash_alg(alg).to_hasher();
        Self { hasher }
    }
}

impl FrameHasher for PerceptualHasher {
    fn supports(&self, kind: AssetKind) -> bool {
        kind == AssetKind::Photo
    }

    fn hash_frame(&self, kind: AssetKind, bytes: &[u8]) -> Result<FrameHash, String> {
        if kind == AssetKind::Video {
            return Err("unsupported codec: video frames cannot be decoded".to_string());
        }

        let img = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| e.to_string())?
            .decode()
            .map_err(|e| e.to_string())?;
        let (width, height) = img.dimensions();
        let hash = self.hasher.hash_image(&img);

        Ok(FrameHash {
            fingerprint: Fingerprint::from_bytes(hash.as_bytes()),
            width,
            height,
        })
    }
}

/// Produces fingerprints for assets, consulting the cache first.
///
/// Safe to call concurrently for distinct assets: the cache lock is only
/// held for lookups and inserts, never across the read and decode.
pub struct FingerprintExtractor {
    hasher: Arc<dyn FrameHasher>,
    cache: Arc<FingerprintCache>,
    read_limit: u64,
}

impl FingerprintExtractor {
    pub const DEFAULT_READ_LIMIT: u64 = 256 * 1024 * 1024;

    pub fn new(hasher: Arc<dyn FrameHasher>, cache: Arc<FingerprintCache>) -> Self {
        Self {
            hasher,
            cache,
            read_limit: Self::DEFAULT_READ_LIMIT,
        }
    }

    /// Caps the bytes buffered for any one asset.
    pub fn with_read_limit(mut self, limit: u64) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn read_limit(&self) -> u64 {
        self.read_limit
    }

    pub fn hasher(&self) -> &Arc<dyn FrameHasher> {
        &self.hasher
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    pub fn extract<S: MediaStore + ?Sized>(
        &self,
        store: &S,
        handle: &AssetHandle,
    ) -> Result<FingerprintRecord, ExtractError> {
        if let Some(record) = self.cache.get(&handle.id, &handle.token) {
            return Ok(record);
        }

        let unreadable = |reason: String| ExtractError::UnreadableAsset {
            id: handle.id.to_string(),
            reason,
        };

        if !self.hasher.supports(handle.kind) {
            return Err(unreadable(format!("unsupported media kind {:?}", handle.kind)));
        }
        if handle.byte_size > self.read_limit {
            return Err(unreadable(format!(
                "{} bytes exceeds the {} byte read limit",
                handle.byte_size, self.read_limit
            )));
        }

        let record = {
            let bytes = store
                .read_bytes(handle, self.read_limit)
                .map_err(|e| unreadable(e.to_string()))?;
            let frame = self
                .hasher
                .hash_frame(handle.kind, &bytes)
                .map_err(unreadable)?;
            FingerprintRecord {
                fingerprint: frame.fingerprint,
                digest: blake3::hash(&bytes).to_hex().to_string(),
                width: frame.width,
                height: frame.height,
            }
        };

        self.cache
            .insert(handle.id.clone(), handle.token.clone(), record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::asset::ContentToken;
    use crate::services::memory_store::MemoryMediaStore;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_test_image(width: u32, height: u32, shift: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = (((x + shift) * 7 + y * 3) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    struct CountingHasher {
        calls: AtomicUsize,
    }

    impl FrameHasher for CountingHasher {
        fn hash_frame(&self, _kind: AssetKind, bytes: &[u8]) -> Result<FrameHash, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FrameHash {
                fingerprint: Fingerprint::from_bytes(bytes),
                width: 1,
                height: 1,
            })
        }
    }

    fn handle(id: &str, kind: AssetKind, token: &str) -> AssetHandle {
        AssetHandle::new(id, kind, 10, ContentToken::new(token))
    }

    #[test]
    fn test_perceptual_hash_of_identical_images_matches() {
        let hasher = PerceptualHasher::new(HashAlgorithm::Gradient);
        let bytes = create_test_image(64, 48, 0);

        let first = hasher.hash_frame(AssetKind::Photo, &bytes).unwrap();
        let second = hasher.hash_frame(AssetKind::Photo, &bytes).unwrap();
        assert_eq!(first, second);
        assert_eq!((first.width, first.height), (64, 48));
    }

    #[test]
    fn test_perceptual_hasher_rejects_garbage_and_video() {
        let hasher = PerceptualHasher::new(HashAlgorithm::Mean);
        assert!(hasher.hash_frame(AssetKind::Photo, b"not an image").is_err());

        let bytes = create_test_image(8, 8, 0);
        let err = hasher.hash_frame(AssetKind::Video, &bytes).unwrap_err();
        assert!(err.contains("unsupported codec"));
    }

    #[test]
    fn test_unchanged_asset_is_not_refingerprinted() {
        let store = MemoryMediaStore::new();
        let h = handle("a", AssetKind::Photo, "v1");
        store.insert(h.clone(), vec![1, 2, 3]);

        let hasher = Arc::new(CountingHasher {
            calls: AtomicUsize::new(0),
        });
        let extractor =
            FingerprintExtractor::new(hasher.clone(), Arc::new(FingerprintCache::new(8)));

        let first = extractor.extract(&store, &h).unwrap();
        let second = extractor.extract(&store, &h).unwrap();
        assert_eq!(first, second);
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 1);

        // a new content token forces a recompute
        let changed = handle("a", AssetKind::Photo, "v2");
        store.insert(changed.clone(), vec![9, 9, 9]);
        let third = extractor.extract(&store, &changed).unwrap();
        assert_ne!(first.digest, third.digest);
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_bytes_are_unreadable() {
        let store = MemoryMediaStore::new();
        let extractor = FingerprintExtractor::new(
            Arc::new(PerceptualHasher::new(HashAlgorithm::Gradient)),
            Arc::new(FingerprintCache::new(8)),
        );

        let err = extractor
            .extract(&store, &handle("ghost", AssetKind::Photo, "t"))
            .unwrap_err();
        let ExtractError::UnreadableAsset { id, .. } = err;
        assert_eq!(id, "ghost");
        assert!(extractor.cache().is_empty());
    }

    #[test]
    fn test_unsupported_kind_is_rejected_without_reading() {
        let store = MemoryMediaStore::new();
        let clip = handle("clip", AssetKind::Video, "t");
        store.insert(clip.clone(), vec![0; 64]);
        let extractor = FingerprintExtractor::new(
            Arc::new(PerceptualHasher::new(HashAlgorithm::Gradient)),
            Arc::new(FingerprintCache::new(8)),
        )
        // any read would fail on size, so the reason shows none happened
        .with_read_limit(8);

        let ExtractError::UnreadableAsset { reason, .. } =
            extractor.extract(&store, &clip).unwrap_err();
        assert!(reason.contains("unsupported media kind"));
    }

    #[test]
    fn test_reads_are_capped_at_the_limit() {
        let store = MemoryMediaStore::new();
        let hasher = Arc::new(CountingHasher {
            calls: AtomicUsize::new(0),
        });
        let extractor = FingerprintExtractor::new(hasher.clone(), Arc::new(FingerprintCache::new(8)))
            .with_read_limit(4);

        // listed size is wrong, so only the store's cap catches it
        let understated = AssetHandle::new("a", AssetKind::Photo, 2, ContentToken::new("t"));
        store.insert(understated.clone(), vec![1; 32]);
        let ExtractError::UnreadableAsset { reason, .. } =
            extractor.extract(&store, &understated).unwrap_err();
        assert!(reason.contains("read limit"));

        let declared = AssetHandle::new("b", AssetKind::Photo, 1 << 30, ContentToken::new("t"));
        assert!(extractor.extract(&store, &declared).is_err());
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 0);
    }
}
