use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::TaskboxError;

/// How the container is attached to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network at all (`--network=none`)
    #[default]
    Isolated,
    /// Default bridge network, required for published ports
    Bridged,
    /// Share the host network stack
    Host,
}

impl NetworkMode {
    /// Value for the engine's `--network` flag.
    pub fn engine_value(&self) -> &'static str {
        match self {
            Self::Isolated => "none",
            Self::Bridged => "bridge",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolated => f.write_str("isolated"),
            Self::Bridged => f.write_str("bridged"),
            Self::Host => f.write_str("host"),
        }
    }
}

/// A published port. `host_port == None` asks the engine for a dynamic port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub host_port: Option<u16>,
    pub container_port: u16,
}

impl PortSpec {
    /// Value for the engine's `-p` flag.
    pub fn engine_value(&self) -> String {
        match self.host_port {
            Some(host) => format!("{}:{}", host, self.container_port),
            None => self.container_port.to_string(),
        }
    }
}

impl FromStr for PortSpec {
    type Err = TaskboxError;

    /// Accepts `hostPort:containerPort`, `0:containerPort` or `containerPort`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TaskboxError::InvalidPortSpec {
            spec: s.to_string(),
        };
        let parse = |p: &str| p.trim().parse::<u16>().map_err(|_| invalid());

        let (host_port, container_port) = match s.split_once(':') {
            Some((host, container)) => {
                let host = parse(host)?;
                (if host == 0 { None } else { Some(host) }, parse(container)?)
            }
            None => (None, parse(s)?),
        };

        if container_port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            host_port,
            container_port,
        })
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.host_port.unwrap_or(0),
            self.container_port
        )
    }
}

/// A host directory mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    #[serde(default)]
    pub readonly: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly: false,
        }
    }

    /// Value for the engine's `-v` flag.
    pub fn engine_value(&self) -> String {
        let mode = if self.readonly { "ro" } else { "rw" };
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            mode
        )
    }
}

impl FromStr for VolumeMount {
    type Err = TaskboxError;

    /// Format: host_path:container_path[:ro]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let mount = match parts.as_slice() {
            [host, container] => VolumeMount::new(*host, *container),
            [host, container, "ro"] => VolumeMount {
                readonly: true,
                ..VolumeMount::new(*host, *container)
            },
            [host, container, "rw"] => VolumeMount::new(*host, *container),
            _ => {
                return Err(TaskboxError::InvalidMount {
                    spec: s.to_string(),
                })
            }
        };

        if mount.host_path.as_os_str().is_empty() || !mount.container_path.starts_with('/') {
            return Err(TaskboxError::InvalidMount {
                spec: s.to_string(),
            });
        }

        Ok(mount)
    }
}

/// Immutable per-sandbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub image: String,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub pids_limit: Option<u32>,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Empty means "mount the task workspace at `workdir`"
    #[serde(default)]
    pub mounts: Vec<VolumeMount>,
    pub workdir: String,
}

impl SandboxConfig {
    pub fn new(image: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            memory_limit: None,
            cpus: None,
            pids_limit: None,
            network: NetworkMode::default(),
            env: Vec::new(),
            ports: Vec::new(),
            mounts: Vec::new(),
            workdir: workdir.into(),
        }
    }
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => f.write_str("creating"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Coarse routing tag used by callers, not by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRole {
    Frontend,
    Backend,
    Fullstack,
}

/// Caller-provided identity metadata stored alongside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHints {
    pub repository: Option<String>,
    pub role: Option<SandboxRole>,
}

/// A tracked sandbox bound to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub task_id: String,
    /// Engine-assigned id, empty until the container exists
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub workspace_path: PathBuf,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub config: SandboxConfig,
    #[serde(default)]
    mapped_ports: BTreeMap<u16, u16>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub role: Option<SandboxRole>,
}

impl SandboxInstance {
    pub fn new(
        task_id: impl Into<String>,
        container_name: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
        config: SandboxConfig,
        hints: IdentityHints,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            container_id: String::new(),
            container_name: container_name.into(),
            image: config.image.clone(),
            workspace_path: workspace_path.into(),
            status: SandboxStatus::Creating,
            created_at: Utc::now(),
            config,
            mapped_ports: BTreeMap::new(),
            repository: hints.repository,
            role: hints.role,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }

    /// Container-port to host-port map, only while the sandbox is running.
    pub fn mapped_ports(&self) -> Option<&BTreeMap<u16, u16>> {
        self.is_running().then_some(&self.mapped_ports)
    }

    pub fn set_mapped_ports(&mut self, ports: BTreeMap<u16, u16>) {
        self.mapped_ports = ports;
    }

    /// Move to a new status; leaving `running` invalidates the port map.
    pub fn set_status(&mut self, status: SandboxStatus) {
        self.status = status;
        if status != SandboxStatus::Running {
            self.mapped_ports.clear();
        }
    }

    /// Resolve a command working directory inside the container.
    pub fn resolve_workdir(&self, cwd: Option<&str>) -> String {
        match cwd {
            Some(dir) if dir.starts_with('/') => dir.to_string(),
            Some(dir) if !dir.is_empty() => {
                let base = self.config.workdir.trim_end_matches('/');
                let rel = dir.trim_start_matches("./").trim_end_matches('/');
                if rel.is_empty() || rel == "." {
                    self.config.workdir.clone()
                } else {
                    format!("{}/{}", base, rel)
                }
            }
            _ => self.config.workdir.clone(),
        }
    }
}
