use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sandbox::types::{SandboxInstance, SandboxStatus};

/// Authoritative in-memory map of tracked sandboxes, keyed by task id.
///
/// Lookups never do substring matching: a registered id matches a task only
/// when it is equal to it or equal to `task_id + "-" + suffix` (auxiliary
/// sandboxes such as `t1-setup`). `t1` therefore never resolves to `t10`.
///
/// The lock is a plain `std::sync::RwLock` and is never held across an
/// `.await`, so the synchronous exec path can use the registry too.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    entries: RwLock<BTreeMap<String, SandboxInstance>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, SandboxInstance>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every write is a single insert/remove/field assignment.
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, SandboxInstance>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Exact lookup.
    pub fn get(&self, task_id: &str) -> Option<SandboxInstance> {
        self.read().get(task_id).cloned()
    }

    /// Exact, then delimited-prefix match, restricted to running sandboxes.
    pub fn find_running(&self, task_id: &str) -> Option<(String, SandboxInstance)> {
        Self::lookup(&self.read(), task_id, true)
    }

    /// Running pass first, then the same two steps regardless of status.
    ///
    /// Used by destroy-style callers that must also locate stopped or
    /// errored sandboxes.
    pub fn find_for_task(&self, task_id: &str) -> Option<(String, SandboxInstance)> {
        let entries = self.read();
        Self::lookup(&entries, task_id, true).or_else(|| Self::lookup(&entries, task_id, false))
    }

    fn lookup(
        entries: &BTreeMap<String, SandboxInstance>,
        task_id: &str,
        running_only: bool,
    ) -> Option<(String, SandboxInstance)> {
        let eligible = |inst: &SandboxInstance| !running_only || inst.is_running();

        if let Some(inst) = entries.get(task_id).filter(|inst| eligible(inst)) {
            return Some((task_id.to_string(), inst.clone()));
        }

        let prefix = format!("{}-", task_id);
        entries
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .find(|(id, inst)| id.len() > prefix.len() && eligible(inst))
            .map(|(id, inst)| (id.clone(), inst.clone()))
    }

    /// Insert or replace the sandbox registered under `id`.
    pub fn put(&self, id: impl Into<String>, instance: SandboxInstance) {
        self.write().insert(id.into(), instance);
    }

    pub fn remove(&self, id: &str) -> Option<SandboxInstance> {
        self.write().remove(id)
    }

    /// Update the status of a registered sandbox, returning the new snapshot.
    pub fn update_status(&self, id: &str, status: SandboxStatus) -> Option<SandboxInstance> {
        let mut entries = self.write();
        let inst = entries.get_mut(id)?;
        inst.set_status(status);
        Some(inst.clone())
    }

    /// Snapshot of every registered sandbox, ordered by task id.
    pub fn all(&self) -> Vec<SandboxInstance> {
        self.read().values().cloned().collect()
    }

    /// Number of running sandboxes.
    pub fn running_count(&self) -> usize {
        self.read().values().filter(|i| i.is_running()).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
