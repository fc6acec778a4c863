//! Training data snapshot resolution

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSnapshot {
    pub snapshot_ref: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Trait for locating the newest training data
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// `Ok(None)` when no data is available at all
    async fn latest(&self) -> Result<Option<DataSnapshot>>;
}

/// Always resolves to a fixed reference
pub struct StaticSnapshotSource {
    snapshot_ref: Option<String>,
}

impl StaticSnapshotSource {
    pub fn new(snapshot_ref: impl Into<String>) -> Self {
        Self {
            snapshot_ref: Some(snapshot_ref.into()),
        }
    }

    pub fn empty() -> Self {
        Self { snapshot_ref: None }
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn latest(&self) -> Result<Option<DataSnapshot>> {
        Ok(self.snapshot_ref.as_ref().map(|r| DataSnapshot {
            snapshot_ref: r.clone(),
            created_at: None,
        }))
    }
}

/// Picks the most recently modified file with the given extension in a
/// raw-data directory.
pub struct DirectorySnapshotSource {
    dir: PathBuf,
    extension: String,
}

impl DirectorySnapshotSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: "csv".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }
}

#[async_trait]
impl SnapshotSource for DirectorySnapshotSource {
    async fn latest(&self) -> Result<Option<DataSnapshot>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut newest: Option<(DateTime<Utc>, PathBuf)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(&self.extension))
                .unwrap_or(false);
            if !matches {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();

            let is_newer = newest
                .as_ref()
                .map(|(ts, p)| (modified, &path) > (*ts, p))
                .unwrap_or(true);
            if is_newer {
                newest = Some((modified, path));
            }
        }

        debug!(dir = %self.dir.display(), found = newest.is_some(), "Scanned snapshot directory");

        Ok(newest.map(|(modified, path)| DataSnapshot {
            snapshot_ref: path.to_string_lossy().into_owned(),
            created_at: Some(modified),
        }))
    }
}
