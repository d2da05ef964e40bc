//! Replication log.
//!
//! Every pull batch for a (folder, source) pair leaves one JSON entry under
//! `<data_dir>/repl-log/`. Entries are write-once; the log can be queried by
//! folder or source and pruned by age.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A replicated version that was not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedVersion {
    pub file_id: Uuid,
    pub version_id: Uuid,
    pub reason: String,
}

/// Record of one pull batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLogEntry {
    /// When the batch finished.
    pub timestamp: DateTime<Utc>,
    pub folder_url: String,
    pub source_id: Uuid,
    pub source_name: String,
    /// Watermark before the batch.
    pub from_watermark: DateTime<Utc>,
    /// Watermark after the batch.
    pub to_watermark: DateTime<Utc>,
    /// Versions written locally.
    pub applied: u64,
    /// Versions that were already present.
    pub present: u64,
    /// Deletions applied as soft deletes.
    pub deleted: u64,
    #[serde(default)]
    pub skipped: Vec<SkippedVersion>,
    /// Content bytes received.
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Directory of replication log entries.
pub struct ReplicationLog {
    log_dir: PathBuf,
}

impl ReplicationLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            log_dir: data_dir.join("repl-log"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create replication log dir {:?}", self.log_dir))
    }

    /// Append an entry; returns the file it was written to.
    pub fn append(&self, entry: &ReplicationLogEntry) -> Result<PathBuf> {
        self.ensure_dir()?;
        let filename = format!(
            "{:020}_{}.json",
            entry.timestamp.timestamp_micros(),
            Uuid::new_v4().simple()
        );
        let path = self.log_dir.join(filename);
        let data = serde_json::to_string_pretty(entry)?;
        fs::write(&path, data)
            .with_context(|| format!("Failed to write replication log entry {:?}", path))?;
        Ok(path)
    }

    fn read_all(&self) -> Result<Vec<(PathBuf, ReplicationLogEntry)>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                // Unreadable entries are not fatal for listing
                if let Ok(data) = fs::read_to_string(&path) {
                    if let Ok(log_entry) = serde_json::from_str::<ReplicationLogEntry>(&data) {
                        entries.push((path, log_entry));
                    }
                }
            }
        }
        entries.sort_by_key(|(_, e)| e.timestamp);
        Ok(entries)
    }

    /// Entries matching the optional folder and source, oldest first.
    pub fn query(&self, folder_url: Option<&str>, source_id: Option<Uuid>) -> Result<Vec<ReplicationLogEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| folder_url.is_none_or(|f| e.folder_url == f))
            .filter(|e| source_id.is_none_or(|s| e.source_id == s))
            .collect())
    }

    pub fn all(&self) -> Result<Vec<ReplicationLogEntry>> {
        self.query(None, None)
    }

    pub fn latest(&self) -> Result<Option<ReplicationLogEntry>> {
        Ok(self.all()?.into_iter().last())
    }

    /// Remove entries written before `cutoff`; returns how many were removed.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        for (path, entry) in self.read_all()? {
            if entry.timestamp < cutoff {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
