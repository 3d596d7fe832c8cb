//! Durable persistence for sandbox records.
//!
//! The registry is the in-memory source of truth while the process runs; a
//! [`SandboxStore`] lets it survive restarts. Startup reconciliation reads
//! every record back and checks it against the engine.

mod json;

pub use json::JsonFileStore;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::{SandboxInstance, SandboxStatus};

/// Persistence adapter for sandbox records, keyed by task id.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Insert or replace the record for `instance.task_id`.
    async fn upsert(&self, instance: &SandboxInstance) -> Result<()>;

    async fn find_all(&self) -> Result<Vec<SandboxInstance>>;

    /// Returns whether a record was removed.
    async fn delete_by_task_id(&self, task_id: &str) -> Result<bool>;

    /// Returns whether a record was updated.
    async fn update_status(&self, task_id: &str, status: SandboxStatus) -> Result<bool>;
}

/// Non-durable store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, SandboxInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SandboxInstance>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn upsert(&self, instance: &SandboxInstance) -> Result<()> {
        self.records()
            .insert(instance.task_id.clone(), instance.clone());
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<SandboxInstance>> {
        Ok(self.records().values().cloned().collect())
    }

    async fn delete_by_task_id(&self, task_id: &str) -> Result<bool> {
        Ok(self.records().remove(task_id).is_some())
    }

    async fn update_status(&self, task_id: &str, status: SandboxStatus) -> Result<bool> {
        match self.records().get_mut(task_id) {
            Some(record) => {
                record.set_status(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{IdentityHints, SandboxConfig};

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let inst = SandboxInstance::new(
            "t1",
            "taskbox-x",
            "/ws",
            SandboxConfig::new("alpine:3", "/workspace"),
            IdentityHints::default(),
        );

        store.upsert(&inst).await.unwrap();
        assert_eq!(store.find_all().await.unwrap().len(), 1);

        assert!(store.update_status("t1", SandboxStatus::Error).await.unwrap());
        assert!(!store.update_status("t2", SandboxStatus::Error).await.unwrap());
        assert_eq!(
            store.find_all().await.unwrap()[0].status,
            SandboxStatus::Error
        );

        assert!(store.delete_by_task_id("t1").await.unwrap());
        assert!(!store.delete_by_task_id("t1").await.unwrap());
    }
}
