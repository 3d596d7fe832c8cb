#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use taskbox::engine::{ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, Invocation};
use taskbox::sandbox::{ManagerSettings, ProbeSettings, SandboxManager, VolumeMount};
use taskbox::store::SandboxStore;
use taskbox::{Result, TaskboxError};

pub const PREFIX: &str = "taskbox";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub state: ContainerState,
    pub image: String,
    pub workdir: String,
    pub mounts: Vec<VolumeMount>,
    pub ports: Vec<u16>,
    pub task_id: String,
}

/// In-memory engine. Commands "inside" a container run on the host through
/// `sh -c`, with the container workdir mapped back through its mounts.
#[derive(Default)]
pub struct FakeEngine {
    pub containers: Mutex<BTreeMap<String, FakeContainer>>,
    pub unavailable: AtomicBool,
    pub fail_run: Mutex<Option<String>>,
    pub run_delay: Mutex<Duration>,
    pub exec_program: Mutex<Option<String>>,
    pub inspect_errors: Mutex<Vec<String>>,
    pub run_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn containers(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, FakeContainer>> {
        self.containers.lock().unwrap()
    }

    pub fn insert(&self, name: &str, state: ContainerState) {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers().insert(
            name.to_string(),
            FakeContainer {
                id,
                state,
                image: "alpine:3".to_string(),
                workdir: "/workspace".to_string(),
                mounts: Vec::new(),
                ports: Vec::new(),
                task_id: String::new(),
            },
        );
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        if let Some(c) = self.containers().get_mut(name) {
            c.state = state;
        }
    }

    pub fn get(&self, name: &str) -> Option<FakeContainer> {
        self.containers().get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.containers().contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.containers().len()
    }

    pub fn runs(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    fn host_dir(container: &FakeContainer, workdir: &str) -> Option<PathBuf> {
        container.mounts.iter().find_map(|m| {
            let base = m.container_path.trim_end_matches('/');
            if workdir == base {
                Some(m.host_path.clone())
            } else {
                workdir
                    .strip_prefix(&format!("{}/", base))
                    .map(|rest| m.host_path.join(rest))
            }
        })
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn cli_installed(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn install(&self) -> Result<()> {
        Err(TaskboxError::engine("install", "not supported"))
    }

    async fn daemon_ready(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn start_daemon(&self) -> Result<()> {
        Err(TaskboxError::engine("start daemon", "not supported"))
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.run_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(stderr) = self.fail_run.lock().unwrap().clone() {
            return Err(TaskboxError::engine("run", stderr));
        }

        let mut containers = self.containers();
        if containers.contains_key(&spec.name) {
            return Err(TaskboxError::engine(
                "run",
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                state: ContainerState::Running,
                image: spec.image.clone(),
                workdir: spec.workdir.clone(),
                mounts: spec.mounts.clone(),
                ports: spec.ports.iter().map(|p| p.container_port).collect(),
                task_id: spec.task_id.clone(),
            },
        );
        Ok(id)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        if self.inspect_errors.lock().unwrap().iter().any(|n| n == name) {
            return Err(TaskboxError::engine("inspect", "daemon hiccup"));
        }
        Ok(self.containers().get(name).map(|c| ContainerInfo {
            id: c.id.clone(),
            name: name.to_string(),
            state: c.state.clone(),
            image: c.image.clone(),
            workdir: c.workdir.clone(),
        }))
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self.containers().get_mut(name) {
            Some(c) if c.state.is_restartable() => {
                c.state = ContainerState::Running;
                Ok(())
            }
            Some(c) if c.state == ContainerState::Running => Ok(()),
            Some(c) => Err(TaskboxError::engine("start", format!("cannot start {}", c.state))),
            None => Err(TaskboxError::engine("start", "No such container")),
        }
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        match self.containers().get_mut(name) {
            Some(c) => {
                c.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(TaskboxError::engine("stop", "No such container")),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.containers().remove(name);
        Ok(())
    }

    async fn port_table(&self, container: &str) -> Result<String> {
        let containers = self.containers();
        let c = containers
            .get(container)
            .ok_or_else(|| TaskboxError::engine("port", "No such container"))?;
        Ok(c.ports
            .iter()
            .map(|p| {
                format!(
                    "{p}/tcp -> 0.0.0.0:{h}\n{p}/tcp -> [::]:{h}\n",
                    p = p,
                    h = 40000 + p
                )
            })
            .collect())
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        let wanted = format!("{}-", prefix);
        Ok(self
            .containers()
            .keys()
            .filter(|n| n.starts_with(&wanted))
            .cloned()
            .collect())
    }

    fn exec_invocation(
        &self,
        container: &str,
        workdir: &str,
        env: &[(String, String)],
        command: &str,
    ) -> Invocation {
        if let Some(program) = self.exec_program.lock().unwrap().clone() {
            return Invocation {
                program,
                ..Default::default()
            };
        }

        let containers = self.containers();
        match containers.get(container) {
            Some(c) if c.state == ContainerState::Running => Invocation {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), command.to_string()],
                envs: env.to_vec(),
                current_dir: Self::host_dir(c, workdir),
            },
            _ => Invocation {
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    format!(
                        "echo 'Error response from daemon: container {} is not running' >&2; exit 1",
                        container
                    ),
                ],
                ..Default::default()
            },
        }
    }
}

pub fn settings() -> ManagerSettings {
    ManagerSettings {
        container_prefix: PREFIX.to_string(),
        default_image: "ubuntu:24.04".to_string(),
        default_workdir: "/workspace".to_string(),
        stop_grace: Duration::from_secs(1),
        probe: ProbeSettings {
            auto_install: false,
            auto_start: false,
            poll_interval: Duration::from_millis(5),
            start_timeout: Duration::from_millis(20),
        },
    }
}

pub fn manager(engine: Arc<FakeEngine>, store: Arc<dyn SandboxStore>) -> SandboxManager {
    SandboxManager::with_parts(engine, store, settings())
}
