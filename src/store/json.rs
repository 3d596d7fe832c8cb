use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sandbox::{container_name, SandboxInstance, SandboxStatus};
use crate::store::SandboxStore;

/// Prefix used only to derive record file names; independent of the
/// container prefix so records stay addressable if that is reconfigured.
const RECORD_PREFIX: &str = "sandbox";

/// One pretty-printed JSON file per sandbox.
///
/// File names are derived from a hash of the task id, so arbitrary task ids
/// (slashes, spaces, unicode) are safe on disk. Writes go to a temp file
/// first and are renamed into place.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the records directory exists
    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Get record file path
    fn record_path(&self, task_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", container_name(RECORD_PREFIX, task_id)))
    }

    async fn read_record(path: &Path) -> Option<SandboxInstance> {
        match fs::read_to_string(path).await {
            Ok(json) => match serde_json::from_str::<SandboxInstance>(&json) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable sandbox record");
                    None
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Failed to read sandbox record");
                None
            }
        }
    }
}

#[async_trait]
impl SandboxStore for JsonFileStore {
    async fn upsert(&self, instance: &SandboxInstance) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.record_path(&instance.task_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(instance)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        debug!(task_id = %instance.task_id, path = %path.display(), "Saved sandbox record");
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<SandboxInstance>> {
        self.ensure_dir().await?;

        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(instance) = Self::read_record(&path).await {
                    records.push(instance);
                }
            }
        }

        // Oldest first, so reconciliation walks records in creation order
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(records)
    }

    async fn delete_by_task_id(&self, task_id: &str) -> Result<bool> {
        let path = self.record_path(task_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(task_id = %task_id, "Deleted sandbox record");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, task_id: &str, status: SandboxStatus) -> Result<bool> {
        let path = self.record_path(task_id);
        if !path.exists() {
            return Ok(false);
        }

        let Some(mut instance) = Self::read_record(&path).await else {
            return Ok(false);
        };
        instance.set_status(status);
        self.upsert(&instance).await?;
        Ok(true)
    }
}
