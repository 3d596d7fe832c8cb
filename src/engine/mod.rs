//! Container engine seam.
//!
//! Everything the lifecycle manager needs from the local container runtime
//! goes through [`ContainerEngine`]. The production implementation shells out
//! to a Docker-compatible CLI ([`DockerCli`]); tests substitute an in-memory
//! engine.

mod docker;

pub use docker::{parse_inspect_line, run_args, DockerCli};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::{NetworkMode, PortSpec, VolumeMount};

/// Label carrying the owning task id on every managed container.
pub const TASK_LABEL: &str = "taskbox.task-id";

/// Everything needed to start a long-lived sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub task_id: String,
    pub image: String,
    pub memory_limit: Option<String>,
    pub cpus: Option<f64>,
    pub pids_limit: Option<u32>,
    pub network: NetworkMode,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortSpec>,
    pub mounts: Vec<VolumeMount>,
    pub workdir: String,
}

/// Engine-reported container state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerState {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" | "stopped" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Stopped but not removed: safe to `start` again.
    pub fn is_restartable(&self) -> bool {
        matches!(self, Self::Exited | Self::Created)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Restarting => f.write_str("restarting"),
            Self::Removing => f.write_str("removing"),
            Self::Exited => f.write_str("exited"),
            Self::Dead => f.write_str("dead"),
            Self::Unknown(s) => f.write_str(s),
        }
    }
}

/// Result of inspecting a container by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub image: String,
    pub workdir: String,
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Environment set on the spawned process itself
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Human-readable engine name (e.g. "docker")
    fn name(&self) -> &str;

    /// Whether the engine CLI is on PATH.
    async fn cli_installed(&self) -> bool;

    /// Best-effort platform install of the engine.
    async fn install(&self) -> Result<()>;

    /// Whether the daemon answers a lightweight info call.
    async fn daemon_ready(&self) -> bool;

    /// Ask the platform to start the daemon. Does not wait for readiness.
    async fn start_daemon(&self) -> Result<()>;

    /// Start a detached, long-lived container. Returns the engine id.
    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String>;

    /// Inspect a container by name. `Ok(None)` means it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    /// Force-remove a container. Removing a missing container is not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Raw published-port table of a container.
    async fn port_table(&self, container: &str) -> Result<String>;

    /// Names of all containers (any state) whose name starts with `prefix`.
    async fn list_names(&self, prefix: &str) -> Result<Vec<String>>;

    /// Invocation that runs `command` through `sh -c` inside `container`.
    fn exec_invocation(
        &self,
        container: &str,
        workdir: &str,
        env: &[(String, String)],
        command: &str,
    ) -> Invocation;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse(" Exited\n"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("stopped"), ContainerState::Exited);
        assert_eq!(
            ContainerState::parse("configured"),
            ContainerState::Unknown("configured".to_string())
        );
    }

    #[test]
    fn test_restartable_states() {
        assert!(ContainerState::Exited.is_restartable());
        assert!(ContainerState::Created.is_restartable());
        assert!(!ContainerState::Running.is_restartable());
        assert!(!ContainerState::Paused.is_restartable());
        assert!(!ContainerState::Dead.is_restartable());
        assert!(!ContainerState::Restarting.is_restartable());
    }
}
