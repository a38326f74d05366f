use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::extractor::FingerprintRecord;
use crate::core::selection::Selectable;

/// Store-assigned, stable identifier of a media asset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    Photo,
    Video,
}

/// Opaque marker that changes whenever the asset content changes
/// (e.g. modification time plus length).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentToken(String);

impl ContentToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the media store hands out when listing assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetHandle {
    pub id: AssetId,
    pub kind: AssetKind,
    pub byte_size: u64,
    pub captured_at: Option<DateTime<Utc>>,
    pub token: ContentToken,
}

impl AssetHandle {
    pub fn new(id: impl Into<AssetId>, kind: AssetKind, byte_size: u64, token: ContentToken) -> Self {
        Self {
            id: id.into(),
            kind,
            byte_size,
            captured_at: None,
            token,
        }
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = Some(captured_at);
        self
    }
}

impl From<String> for AssetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A scanned asset: the store handle, its protection flag and the
/// fingerprint computed for its current content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub handle: AssetHandle,
    pub protected: bool,
    pub record: FingerprintRecord,
}

impl Asset {
    pub fn id(&self) -> &AssetId {
        &self.handle.id
    }

    pub fn resolution(&self) -> u64 {
        self.record.width as u64 * self.record.height as u64
    }
}

impl Selectable for Asset {
    type Id = AssetId;

    fn id(&self) -> AssetId {
        self.handle.id.clone()
    }

    fn is_protected(&self) -> bool {
        self.protected
    }

    fn byte_size(&self) -> u64 {
        self.handle.byte_size
    }
}
