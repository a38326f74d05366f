use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::core::fingerprint::Fingerprint;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Perceptual hash used to fingerprint decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Mean,
    Gradient,
    VertGradient,
    Blockhash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Banded,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum fingerprint distance (in bits) for two assets to be linked.
    pub threshold: u32,
    pub hash_algorithm: HashAlgorithm,
    pub index: IndexKind,
    /// Items deleted per committed chunk during cleanup.
    pub batch_size: usize,
    /// Assets extracted in parallel before being clustered in order.
    pub scan_chunk_size: usize,
    /// Extraction worker threads; bounds how many decoded buffers are resident.
    pub decode_slots: usize,
    /// Maximum number of cached fingerprints.
    pub cache_capacity: usize,
    /// Largest asset read for fingerprinting; bigger ones are unreadable.
    pub max_read_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: 6,
            hash_algorithm: HashAlgorithm::Gradient,
            index: IndexKind::Banded,
            batch_size: 50,
            scan_chunk_size: 256,
            decode_slots: num_cpus::get().max(1) * 2,
            cache_capacity: 100_000,
            max_read_bytes: 256 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold > Fingerprint::BITS {
            return Err(ConfigError::Invalid {
                field: "threshold",
                reason: format!("must be at most {}", Fingerprint::BITS),
            });
        }

        let positive = [
            ("batch_size", self.batch_size),
            ("scan_chunk_size", self.scan_chunk_size),
            ("decode_slots", self.decode_slots),
            ("cache_capacity", self.cache_capacity),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.max_read_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_read_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "threshold": 3, "index": "linear" }"#).unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.threshold, 3);
        assert_eq!(config.index, IndexKind::Linear);
        assert_eq!(config.batch_size, EngineConfig::default().batch_size);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Gradient);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = EngineConfig::default().with_threshold(65).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "threshold", .. }));

        let err = EngineConfig::default().with_batch_size(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "batch_size", .. }));
    }

    #[test]
    fn test_malformed_file_reports_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ threshold: ").unwrap();

        assert!(matches!(
            EngineConfig::from_json_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
