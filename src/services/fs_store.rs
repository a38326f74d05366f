use chrono::{DateTime, Utc};
use glob::Pattern;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::core::asset::{AssetHandle, AssetKind, ContentToken};
use crate::core::store::{DeleteError, MediaStore, StoreError};

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv"];

fn kind_of(path: &Path) -> Option<AssetKind> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(AssetKind::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(AssetKind::Video)
    } else {
        None
    }
}

/// Media store over a directory tree. Asset ids are paths relative to the
/// root, always with `/` separators.
pub struct FsMediaStore {
    root: PathBuf,
    protected: Vec<Pattern>,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            protected: Vec::new(),
        }
    }

    /// Assets whose id matches any of these glob patterns are protected.
    pub fn with_protected_patterns(mut self, patterns: &[String]) -> Result<Self, StoreError> {
        for pattern in patterns {
            let compiled = Pattern::new(pattern).map_err(|e| StoreError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            self.protected.push(compiled);
        }
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, handle: &AssetHandle) -> PathBuf {
        self.root.join(handle.id.as_str())
    }

    fn handle_for(&self, path: &Path, kind: AssetKind) -> Result<AssetHandle, StoreError> {
        let relative = path.strip_prefix(&self.root).map_err(|_| {
            StoreError::Unavailable(format!("{} is outside {}", path.display(), self.root.display()))
        })?;
        let id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let metadata = fs::metadata(path)?;
        let modified = metadata.modified()?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let token = ContentToken::new(format!("{}-{}", nanos, metadata.len()));
        let captured = metadata.created().unwrap_or(modified);

        Ok(AssetHandle::new(id, kind, metadata.len(), token)
            .with_captured_at(DateTime::<Utc>::from(captured)))
    }
}

impl MediaStore for FsMediaStore {
    fn list_assets(&self) -> Result<Vec<AssetHandle>, StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let mut handles = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = kind_of(path) else {
                continue;
            };
            match self.handle_for(path, kind) {
                Ok(handle) => handles.push(handle),
                Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
            }
        }

        log::debug!("Listed {} assets under {}", handles.len(), self.root.display());
        Ok(handles)
    }

    fn read_bytes(&self, handle: &AssetHandle, limit: u64) -> Result<Vec<u8>, StoreError> {
        let map_err = |e: std::io::Error| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                id: handle.id.to_string(),
            },
            ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                id: handle.id.to_string(),
            },
            _ => StoreError::Io(e),
        };

        let file = fs::File::open(self.path_of(handle)).map_err(map_err)?;
        let mut bytes = Vec::new();
        // one byte past the limit tells an exact fit from an overflow
        file.take(limit.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(map_err)?;
        if bytes.len() as u64 > limit {
            return Err(StoreError::TooLarge {
                id: handle.id.to_string(),
                limit,
            });
        }
        Ok(bytes)
    }

    fn delete(&self, handle: &AssetHandle) -> Result<(), DeleteError> {
        fs::remove_file(self.path_of(handle)).map_err(|e| DeleteError::from(&e))
    }

    fn is_protected(&self, handle: &AssetHandle) -> bool {
        self.protected
            .iter()
            .any(|pattern| pattern.matches(handle.id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::asset::AssetId;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x * 5 + y * 3) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        img.save(path).unwrap();
    }

    fn library() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("favorites")).unwrap();
        create_test_image(&root.join("a.jpg"), 32, 32);
        create_test_image(&root.join("favorites/b.png"), 32, 32);
        fs::write(root.join("clip.MOV"), b"not really a movie").unwrap();
        fs::write(root.join("notes.txt"), b"ignored").unwrap();
        temp_dir
    }

    #[test]
    fn test_lists_media_with_relative_ids() {
        let temp_dir = library();
        let store = FsMediaStore::new(temp_dir.path());

        let handles = store.list_assets().unwrap();
        let ids: Vec<&str> = handles.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a.jpg", "clip.MOV", "favorites/b.png"]);
        assert_eq!(handles[1].kind, AssetKind::Video);
        assert!(handles.iter().all(|h| h.captured_at.is_some()));
    }

    #[test]
    fn test_protected_patterns_match_relative_ids() {
        let temp_dir = library();
        let store = FsMediaStore::new(temp_dir.path())
            .with_protected_patterns(&["favorites/*".to_string()])
            .unwrap();

        let handles = store.list_assets().unwrap();
        let protected: Vec<&AssetId> = handles
            .iter()
            .filter(|h| store.is_protected(h))
            .map(|h| &h.id)
            .collect();
        assert_eq!(protected, vec![&AssetId::new("favorites/b.png")]);

        assert!(matches!(
            FsMediaStore::new(temp_dir.path()).with_protected_patterns(&["[".to_string()]),
            Err(StoreError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_delete_removes_file_and_reports_missing() {
        let temp_dir = library();
        let store = FsMediaStore::new(temp_dir.path());
        let handle = store
            .list_assets()
            .unwrap()
            .into_iter()
            .find(|h| h.id.as_str() == "a.jpg")
            .unwrap();

        assert_eq!(store.delete(&handle), Ok(()));
        assert!(!temp_dir.path().join("a.jpg").exists());
        assert_eq!(store.delete(&handle), Err(DeleteError::NotFound));
        assert!(matches!(
            store.read_bytes(&handle, 1 << 20),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_read_stops_at_limit() {
        let temp_dir = library();
        let store = FsMediaStore::new(temp_dir.path());
        let clip = store
            .list_assets()
            .unwrap()
            .into_iter()
            .find(|h| h.id.as_str() == "clip.MOV")
            .unwrap();
        let len = b"not really a movie".len() as u64;

        assert_eq!(store.read_bytes(&clip, len).unwrap().len() as u64, len);
        assert!(matches!(
            store.read_bytes(&clip, len - 1),
            Err(StoreError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let store = FsMediaStore::new("/definitely/not/here");
        assert!(matches!(
            store.list_assets(),
            Err(StoreError::Unavailable(_))
        ));
    }
}
