use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::core::asset::AssetId;
use crate::core::cleanup::{CleanupBatch, RunStatus};

pub const HISTORY_FILE: &str = ".sweeprs-history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One line of the cleanup history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub timestamp: String,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub deleted: Vec<String>,
    /// Failed ids with the store's reason.
    pub failed: Vec<(String, String)>,
}

impl CleanupRecord {
    pub fn from_batch(batch: &CleanupBatch<AssetId>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id: batch.run_id,
            status: batch.status,
            deleted: batch.deleted_ids().iter().map(|id| id.to_string()).collect(),
            failed: batch
                .failures()
                .into_iter()
                .map(|(id, reason)| (id.to_string(), reason.to_string()))
                .collect(),
        }
    }
}

pub fn append(path: &Path, record: &CleanupRecord) -> Result<(), HistoryError> {
    let mut out = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(out, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

/// Reads every record, skipping malformed lines with a warning. A missing
/// file is an empty history.
pub fn read(path: &Path) -> Result<Vec<CleanupRecord>, HistoryError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CleanupRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => log::warn!("Skipping malformed history entry {}: {}", i, err),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(status: RunStatus) -> CleanupRecord {
        CleanupRecord {
            timestamp: Utc::now().to_rfc3339(),
            run_id: Uuid::new_v4(),
            status,
            deleted: vec!["a.jpg".to_string()],
            failed: vec![("b.jpg".to_string(), "permission denied".to_string())],
        }
    }

    #[test]
    fn test_append_then_read_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HISTORY_FILE);

        let first = record(RunStatus::Completed);
        let second = record(RunStatus::Cancelled);
        append(&path, &first).unwrap();
        append(&path, &second).unwrap();

        assert_eq!(read(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_missing_file_and_malformed_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HISTORY_FILE);
        assert!(read(&path).unwrap().is_empty());

        std::fs::write(&path, "not json\n\n").unwrap();
        append(&path, &record(RunStatus::Failed)).unwrap();
        let records = read(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Failed);
    }
}
