use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::loader::get_store_dir;
use crate::config::types::TaskboxConfig;
use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, DockerCli};
use crate::error::{Result, TaskboxError};
use crate::sandbox::events::{EventBus, SandboxEvent};
use crate::sandbox::executor::{CommandExecutor, CommandResult, ExecOptions, ExecutedIn, OutputChunk};
use crate::sandbox::naming::container_name;
use crate::sandbox::ports;
use crate::sandbox::probe::{EngineProbe, ProbeSettings};
use crate::sandbox::reaper::{self, SweepReport};
use crate::sandbox::registry::SandboxRegistry;
use crate::sandbox::types::{
    IdentityHints, NetworkMode, SandboxConfig, SandboxInstance, SandboxStatus, VolumeMount,
};
use crate::store::{JsonFileStore, SandboxStore};

/// Knobs the manager needs from the loaded configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub container_prefix: String,
    pub default_image: String,
    pub default_workdir: String,
    pub stop_grace: Duration,
    pub probe: ProbeSettings,
}

impl From<&TaskboxConfig> for ManagerSettings {
    fn from(config: &TaskboxConfig) -> Self {
        Self {
            container_prefix: config.engine.container_prefix.clone(),
            default_image: config.defaults.image.clone(),
            default_workdir: config.defaults.workdir.clone(),
            stop_grace: config.engine.stop_grace(),
            probe: ProbeSettings::from(&config.engine),
        }
    }
}

/// Snapshot returned by [`SandboxManager::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub engine_available: bool,
    pub active_sandboxes: usize,
}

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub engine_available: bool,
    /// Containers found running and adopted as-is
    pub adopted: usize,
    /// Stopped containers started again and adopted
    pub restarted: usize,
    /// Records whose container is in an unusable state
    pub marked_error: usize,
    /// Records dropped because their container no longer exists
    pub removed: usize,
    /// Records skipped after an engine error
    pub failed: usize,
}

/// Creates, recovers and destroys per-task sandboxes.
///
/// The registry is the in-memory source of truth; every change is written
/// through to the [`SandboxStore`] before the call returns.
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn SandboxStore>,
    registry: Arc<SandboxRegistry>,
    probe: EngineProbe,
    executor: CommandExecutor,
    events: EventBus,
    settings: ManagerSettings,
    create_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SandboxManager {
    /// Manager backed by the configured engine CLI and the JSON record store.
    pub fn new(config: &TaskboxConfig) -> Self {
        let engine = Arc::new(DockerCli::new(config.engine.clone()));
        let store = Arc::new(JsonFileStore::new(get_store_dir(config)));
        Self::with_parts(engine, store, ManagerSettings::from(config))
    }

    pub fn with_parts(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn SandboxStore>,
        settings: ManagerSettings,
    ) -> Self {
        let registry = Arc::new(SandboxRegistry::new());
        Self {
            probe: EngineProbe::new(engine.clone(), settings.probe.clone()),
            executor: CommandExecutor::new(registry.clone(), engine.clone()),
            engine,
            store,
            registry,
            events: EventBus::default(),
            settings,
            create_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    /// Whether the container engine is usable, probing it if needed.
    pub async fn engine_available(&self) -> bool {
        self.probe.ensure_ready().await
    }

    fn create_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.create_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Prune a create lock nobody else holds. Callers must drop their own
    /// clone first. Lookup and pruning share the map mutex, so a waiter that
    /// already cloned the lock keeps the entry alive.
    fn release_create_lock(&self, name: &str) {
        let mut locks = self.create_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
    }

    async fn persist(&self, instance: &SandboxInstance) {
        if let Err(e) = self.store.upsert(instance).await {
            warn!(task_id = %instance.task_id, error = %e, "Failed to persist sandbox record");
        }
    }

    async fn persisted(&self, task_id: &str) -> Option<SandboxInstance> {
        match self.store.find_all().await {
            Ok(records) => records.into_iter().find(|r| r.task_id == task_id),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to read sandbox records");
                None
            }
        }
    }

    fn emit_error(&self, task_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(task_id = %task_id, message = %message, "Sandbox error");
        self.events.emit(SandboxEvent::Error {
            task_id: task_id.to_string(),
            message,
        });
    }

    /// Create (or return the already running) sandbox for a task.
    ///
    /// Image precedence: `image_override`, then `config.image`, then the
    /// configured default. With no mounts configured the task workspace is
    /// mounted at the sandbox workdir.
    pub async fn create_sandbox(
        &self,
        task_id: &str,
        workspace_path: &Path,
        image_override: Option<&str>,
        config: SandboxConfig,
        hints: IdentityHints,
    ) -> Result<SandboxInstance> {
        if !self.probe.ensure_ready().await {
            return Err(TaskboxError::EngineUnavailable);
        }

        let name = container_name(&self.settings.container_prefix, task_id);
        let lock = self.create_lock(&name);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(task_id, &name, workspace_path, image_override, config, hints)
                .await
        };
        drop(lock);
        self.release_create_lock(&name);
        result
    }

    async fn create_locked(
        &self,
        task_id: &str,
        name: &str,
        workspace_path: &Path,
        image_override: Option<&str>,
        mut config: SandboxConfig,
        hints: IdentityHints,
    ) -> Result<SandboxInstance> {
        if let Some((resolved_id, existing)) = self.registry.find_running(task_id) {
            debug!(task_id = %task_id, resolved_id = %resolved_id, "Reusing running sandbox");
            return Ok(existing);
        }

        // A container left behind by a crashed process would block the name
        if let Err(e) = self.engine.remove(name).await {
            debug!(container = %name, error = %e, "Stale container cleanup failed");
        }

        config.image = resolve_image(image_override, &config.image, &self.settings.default_image);
        if config.mounts.is_empty() {
            config
                .mounts
                .push(VolumeMount::new(workspace_path, config.workdir.clone()));
        }
        if !config.ports.is_empty() && config.network != NetworkMode::Bridged {
            warn!(
                task_id = %task_id,
                network = %config.network,
                "Port publishing requires bridged networking, ports ignored"
            );
        }

        let mut instance = SandboxInstance::new(task_id, name, workspace_path, config, hints);
        let spec = container_spec(&instance);

        info!(
            task_id = %task_id,
            container = %name,
            image = %instance.image,
            "Creating sandbox"
        );

        match self.engine.run_detached(&spec).await {
            Ok(container_id) => {
                instance.container_id = container_id;
                instance.set_status(SandboxStatus::Running);
                if !spec.ports.is_empty() {
                    let mapped = ports::resolve_mapped_ports(self.engine.as_ref(), name).await;
                    instance.set_mapped_ports(mapped);
                }

                self.persist(&instance).await;
                self.registry.put(task_id, instance.clone());
                info!(task_id = %task_id, container = %name, "Sandbox running");
                self.events.emit(SandboxEvent::Created {
                    task_id: task_id.to_string(),
                    container_name: name.to_string(),
                });
                Ok(instance)
            }
            Err(e) => {
                let stderr = match e {
                    TaskboxError::Engine { message, .. } => message,
                    other => other.to_string(),
                };
                instance.set_status(SandboxStatus::Error);
                self.persist(&instance).await;
                self.registry.put(task_id, instance);
                self.emit_error(task_id, format!("create failed: {}", stderr));
                Err(TaskboxError::CreateFailed {
                    task_id: task_id.to_string(),
                    stderr,
                })
            }
        }
    }

    /// Stop and remove a task's sandbox along with its records.
    ///
    /// Returns `false` when neither the registry nor the store knows the task.
    pub async fn destroy_sandbox(&self, task_id: &str) -> bool {
        let (resolved_id, name) = match self.registry.find_for_task(task_id) {
            Some((id, instance)) => (id, instance.container_name),
            None => match self.persisted(task_id).await {
                Some(record) => (record.task_id, record.container_name),
                None => {
                    debug!(task_id = %task_id, "No sandbox to destroy");
                    return false;
                }
            },
        };

        info!(task_id = %task_id, resolved_id = %resolved_id, container = %name, "Destroying sandbox");

        if self.probe.ensure_ready().await {
            if let Err(e) = self.engine.stop(&name, self.settings.stop_grace).await {
                debug!(container = %name, error = %e, "Stop failed, removing anyway");
            }
            if let Err(e) = self.engine.remove(&name).await {
                warn!(container = %name, error = %e, "Failed to remove sandbox container");
            }
        } else {
            warn!(container = %name, "Engine unavailable, dropping records only");
        }

        self.registry.remove(&resolved_id);
        if let Err(e) = self.store.delete_by_task_id(&resolved_id).await {
            warn!(task_id = %resolved_id, error = %e, "Failed to delete sandbox record");
        }
        self.release_create_lock(&name);

        self.events.emit(SandboxEvent::Destroyed {
            task_id: resolved_id,
            container_name: name,
        });
        true
    }

    /// Adopt a container the engine already has for this task, starting it
    /// if it is merely stopped.
    pub async fn find_or_start_existing(
        &self,
        task_id: &str,
        workspace_path: &Path,
    ) -> Option<SandboxInstance> {
        if !self.probe.ensure_ready().await {
            return None;
        }

        let name = container_name(&self.settings.container_prefix, task_id);
        let info = match self.engine.inspect(&name).await {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!(task_id = %task_id, container = %name, error = %e, "Inspect failed");
                return None;
            }
        };

        match &info.state {
            ContainerState::Running => {}
            state if state.is_restartable() => {
                info!(task_id = %task_id, container = %name, state = %state, "Starting stopped sandbox");
                if let Err(e) = self.engine.start(&name).await {
                    self.emit_error(task_id, format!("restart failed: {}", e));
                    return None;
                }
            }
            state => {
                info!(task_id = %task_id, container = %name, state = %state, "Removing unusable sandbox container");
                if let Err(e) = self.engine.remove(&name).await {
                    warn!(container = %name, error = %e, "Failed to remove container");
                }
                return None;
            }
        }

        let instance = match self.persisted(task_id).await {
            Some(record) => record,
            None => self.instance_from_inspect(task_id, workspace_path, &info),
        };
        Some(self.adopt(instance, &info).await)
    }

    fn instance_from_inspect(
        &self,
        task_id: &str,
        workspace_path: &Path,
        info: &ContainerInfo,
    ) -> SandboxInstance {
        let workdir = if info.workdir.is_empty() {
            self.settings.default_workdir.clone()
        } else {
            info.workdir.clone()
        };
        let image = if info.image.is_empty() {
            self.settings.default_image.clone()
        } else {
            info.image.clone()
        };
        SandboxInstance::new(
            task_id,
            info.name.trim_start_matches('/'),
            workspace_path,
            SandboxConfig::new(image, workdir),
            IdentityHints::default(),
        )
    }

    async fn adopt(&self, mut instance: SandboxInstance, info: &ContainerInfo) -> SandboxInstance {
        if !info.id.is_empty() {
            instance.container_id = info.id.clone();
        }
        instance.set_status(SandboxStatus::Running);
        if !instance.config.ports.is_empty() {
            let mapped =
                ports::resolve_mapped_ports(self.engine.as_ref(), &instance.container_name).await;
            instance.set_mapped_ports(mapped);
        }

        self.persist(&instance).await;
        self.registry.put(instance.task_id.clone(), instance.clone());
        info!(task_id = %instance.task_id, container = %instance.container_name, "Sandbox recovered");
        self.events.emit(SandboxEvent::Recovered {
            task_id: instance.task_id.clone(),
            container_name: instance.container_name.clone(),
        });
        instance
    }

    /// Rebuild the registry from persisted records, checking each against
    /// the engine. One failing record never aborts the pass.
    pub async fn load_from_persistence(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if !self.probe.ensure_ready().await {
            warn!("Container engine unavailable, skipping reconciliation");
            return report;
        }
        report.engine_available = true;

        let records = match self.store.find_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to read sandbox records");
                return report;
            }
        };

        for record in records {
            let task_id = record.task_id.clone();
            let name = record.container_name.clone();

            match self.engine.inspect(&name).await {
                Ok(None) => {
                    info!(task_id = %task_id, container = %name, "Container gone, dropping record");
                    self.registry.remove(&task_id);
                    if let Err(e) = self.store.delete_by_task_id(&task_id).await {
                        warn!(task_id = %task_id, error = %e, "Failed to delete sandbox record");
                    }
                    report.removed += 1;
                }
                Ok(Some(info)) if info.state == ContainerState::Running => {
                    self.adopt(record, &info).await;
                    report.adopted += 1;
                }
                Ok(Some(info)) if info.state.is_restartable() => {
                    match self.engine.start(&name).await {
                        Ok(()) => {
                            self.adopt(record, &info).await;
                            report.restarted += 1;
                        }
                        Err(e) => {
                            self.mark_error(&task_id, format!("restart failed: {}", e)).await;
                            report.failed += 1;
                        }
                    }
                }
                Ok(Some(info)) => {
                    self.registry.remove(&task_id);
                    if let Err(e) = self.store.update_status(&task_id, SandboxStatus::Error).await {
                        warn!(task_id = %task_id, error = %e, "Failed to update sandbox record");
                    }
                    self.emit_error(&task_id, format!("container is {}", info.state));
                    report.marked_error += 1;
                }
                Err(e) => {
                    warn!(task_id = %task_id, container = %name, error = %e, "Inspect failed during reconciliation");
                    report.failed += 1;
                }
            }
        }

        info!(
            adopted = report.adopted,
            restarted = report.restarted,
            marked_error = report.marked_error,
            removed = report.removed,
            failed = report.failed,
            "Reconciled sandboxes from persistence"
        );
        report
    }

    async fn mark_error(&self, task_id: &str, message: String) {
        self.registry.update_status(task_id, SandboxStatus::Error);
        if let Err(e) = self.store.update_status(task_id, SandboxStatus::Error).await {
            warn!(task_id = %task_id, error = %e, "Failed to update sandbox record");
        }
        self.emit_error(task_id, message);
    }

    /// Re-inspect a tracked sandbox and update its status from what the
    /// engine reports. Returns the resulting status.
    pub async fn refresh_status(&self, task_id: &str) -> Option<SandboxStatus> {
        let (resolved_id, mut instance) = self.registry.find_for_task(task_id)?;

        match self.engine.inspect(&instance.container_name).await {
            Ok(Some(info)) if info.state == ContainerState::Running => {
                if !instance.is_running() {
                    instance.set_status(SandboxStatus::Running);
                    if !instance.config.ports.is_empty() {
                        let mapped = ports::resolve_mapped_ports(
                            self.engine.as_ref(),
                            &instance.container_name,
                        )
                        .await;
                        instance.set_mapped_ports(mapped);
                    }
                    self.persist(&instance).await;
                    self.registry.put(resolved_id, instance);
                }
                Some(SandboxStatus::Running)
            }
            Ok(observed) => {
                if instance.status != SandboxStatus::Error {
                    let state = observed
                        .map(|info| info.state.to_string())
                        .unwrap_or_else(|| "missing".to_string());
                    self.mark_error(&resolved_id, format!("container is {}", state))
                        .await;
                }
                Some(SandboxStatus::Error)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Inspect failed, keeping last known status");
                Some(instance.status)
            }
        }
    }

    pub async fn get_status(&self) -> ManagerStatus {
        ManagerStatus {
            engine_available: self.probe.ensure_ready().await,
            active_sandboxes: self.registry.running_count(),
        }
    }

    /// Tracked sandbox for a task, any status.
    pub fn get_sandbox(&self, task_id: &str) -> Option<SandboxInstance> {
        self.registry.find_for_task(task_id).map(|(_, instance)| instance)
    }

    pub fn all_sandboxes(&self) -> Vec<SandboxInstance> {
        self.registry.all()
    }

    /// Re-query the engine for a running sandbox's published ports.
    pub async fn resolve_mapped_ports(&self, task_id: &str) -> Option<BTreeMap<u16, u16>> {
        let (resolved_id, mut instance) = self.registry.find_running(task_id)?;
        let mapped = ports::resolve_mapped_ports(self.engine.as_ref(), &instance.container_name).await;
        instance.set_mapped_ports(mapped.clone());
        self.persist(&instance).await;
        self.registry.put(resolved_id, instance);
        Some(mapped)
    }

    /// Run a command in the task's sandbox, or on the host without one.
    pub async fn exec(&self, task_id: &str, command: &str, opts: &ExecOptions) -> CommandResult {
        let result = self.executor.exec(task_id, command, opts).await;
        self.observe(task_id, &result).await;
        result
    }

    pub async fn exec_streaming(
        &self,
        task_id: &str,
        command: &str,
        opts: &ExecOptions,
        sink: mpsc::Sender<OutputChunk>,
    ) -> CommandResult {
        let result = self.executor.exec_streaming(task_id, command, opts, sink).await;
        self.observe(task_id, &result).await;
        result
    }

    /// Synchronous exec. Status is not re-observed on failure.
    pub fn exec_blocking(&self, task_id: &str, command: &str, opts: &ExecOptions) -> CommandResult {
        self.executor.exec_blocking(task_id, command, opts)
    }

    /// A failed in-sandbox command may mean the container itself died.
    async fn observe(&self, task_id: &str, result: &CommandResult) {
        if result.executed_in == ExecutedIn::Sandbox && !result.success() && !result.timed_out() {
            self.refresh_status(task_id).await;
        }
    }

    /// Remove managed containers that have neither a record nor a registry
    /// entry. Never runs on its own.
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        if !self.probe.ensure_ready().await {
            return Err(TaskboxError::EngineUnavailable);
        }

        let mut known: HashSet<String> = self
            .store
            .find_all()
            .await?
            .into_iter()
            .map(|r| r.container_name)
            .collect();
        known.extend(self.registry.all().into_iter().map(|i| i.container_name));

        let report = reaper::sweep(
            self.engine.as_ref(),
            &self.settings.container_prefix,
            &known,
        )
        .await?;
        info!(
            removed = report.removed.len(),
            kept = report.kept,
            failed = report.failed.len(),
            "Orphan sweep finished"
        );
        Ok(report)
    }
}

fn resolve_image(image_override: Option<&str>, configured: &str, default: &str) -> String {
    image_override
        .filter(|image| !image.trim().is_empty())
        .or_else(|| Some(configured).filter(|image| !image.trim().is_empty()))
        .unwrap_or(default)
        .to_string()
}

fn container_spec(instance: &SandboxInstance) -> ContainerSpec {
    let config = &instance.config;
    ContainerSpec {
        name: instance.container_name.clone(),
        task_id: instance.task_id.clone(),
        image: instance.image.clone(),
        memory_limit: config.memory_limit.clone(),
        cpus: config.cpus,
        pids_limit: config.pids_limit,
        network: config.network,
        env: config.env.clone(),
        ports: if config.network == NetworkMode::Bridged {
            config.ports.clone()
        } else {
            Vec::new()
        },
        mounts: config.mounts.clone(),
        workdir: config.workdir.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::PortSpec;

    #[test]
    fn test_resolve_image_precedence() {
        assert_eq!(resolve_image(Some("node:20"), "alpine:3", "ubuntu:24.04"), "node:20");
        assert_eq!(resolve_image(None, "alpine:3", "ubuntu:24.04"), "alpine:3");
        assert_eq!(resolve_image(Some(" "), "", "ubuntu:24.04"), "ubuntu:24.04");
    }

    #[test]
    fn test_container_spec_drops_ports_without_bridge() {
        let mut config = SandboxConfig::new("alpine:3", "/workspace");
        config.ports.push(PortSpec {
            host_port: None,
            container_port: 3000,
        });
        let mut instance =
            SandboxInstance::new("t1", "taskbox-x", "/ws", config, IdentityHints::default());
        assert!(container_spec(&instance).ports.is_empty());

        instance.config.network = NetworkMode::Bridged;
        assert_eq!(container_spec(&instance).ports.len(), 1);
    }

    fn bare_manager() -> SandboxManager {
        let config = TaskboxConfig::default();
        SandboxManager::with_parts(
            Arc::new(DockerCli::new(config.engine.clone())),
            Arc::new(crate::store::MemoryStore::new()),
            ManagerSettings::from(&config),
        )
    }

    fn lock_count(manager: &SandboxManager) -> usize {
        manager.create_locks.lock().unwrap().len()
    }

    #[test]
    fn test_create_lock_pruned_when_unheld() {
        let manager = bare_manager();
        let lock = manager.create_lock("taskbox-a");
        assert_eq!(lock_count(&manager), 1);

        drop(lock);
        manager.release_create_lock("taskbox-a");
        assert_eq!(lock_count(&manager), 0);
    }

    #[test]
    fn test_create_lock_kept_while_another_caller_holds_it() {
        let manager = bare_manager();
        let first = manager.create_lock("taskbox-a");
        let waiter = manager.create_lock("taskbox-a");
        assert!(Arc::ptr_eq(&first, &waiter));

        drop(first);
        manager.release_create_lock("taskbox-a");
        assert_eq!(lock_count(&manager), 1);

        // The next caller still serializes on the waiter's lock
        let next = manager.create_lock("taskbox-a");
        assert!(Arc::ptr_eq(&next, &waiter));

        drop(waiter);
        drop(next);
        manager.release_create_lock("taskbox-a");
        assert_eq!(lock_count(&manager), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let config = TaskboxConfig::default();
        let settings = ManagerSettings::from(&config);
        assert_eq!(settings.container_prefix, "taskbox");
        assert_eq!(settings.stop_grace, Duration::from_secs(10));
    }
}
