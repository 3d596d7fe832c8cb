use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TaskboxError};
use crate::sandbox::NetworkMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskboxConfig {
    pub engine: EngineConfig,
    pub defaults: SandboxDefaults,
    pub store: StoreConfig,
}

impl TaskboxConfig {
    /// Reject values that would produce unusable container names or busy loops.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.engine.container_prefix;
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(TaskboxError::Config(format!(
                "engine.container_prefix must be 1-{} characters",
                MAX_PREFIX_LEN
            )));
        }
        let mut chars = prefix.chars();
        let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !first_ok || !rest_ok {
            return Err(TaskboxError::Config(format!(
                "engine.container_prefix '{}' must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
                prefix
            )));
        }

        if self.engine.start_poll_interval_secs == 0 {
            return Err(TaskboxError::Config(
                "engine.start_poll_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.defaults.workdir.trim().is_empty() {
            return Err(TaskboxError::Config(
                "defaults.workdir must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Longest accepted container name prefix.
pub const MAX_PREFIX_LEN: usize = 40;

/// Container engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Docker-compatible CLI binary (docker, podman, ...)
    pub binary: String,
    /// Prefix for every container this tool creates
    pub container_prefix: String,
    /// Try to install the engine when the CLI is missing
    pub auto_install: bool,
    /// Try to start the daemon when it does not respond
    pub auto_start: bool,
    /// Seconds between daemon readiness polls after a start attempt
    pub start_poll_interval_secs: u64,
    /// Give up waiting for the daemon after this many seconds
    pub start_timeout_secs: u64,
    /// Grace period for `stop` before the engine kills the container
    pub stop_grace_secs: u64,
    /// Upper bound for `run`, which may include an image pull
    pub create_timeout_secs: u64,
    /// Upper bound for short engine calls (inspect, start, rm, port, ps)
    pub inspect_timeout_secs: u64,
    /// Upper bound for an automatic engine install
    pub install_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            container_prefix: "taskbox".to_string(),
            auto_install: false,
            auto_start: true,
            start_poll_interval_secs: 2,
            start_timeout_secs: 60,
            stop_grace_secs: 10,
            create_timeout_secs: 300,
            inspect_timeout_secs: 30,
            install_timeout_secs: 600,
        }
    }
}

impl EngineConfig {
    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_secs(self.start_poll_interval_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Defaults applied to sandboxes created from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxDefaults {
    /// Image used when neither the request nor the sandbox config names one
    pub image: String,
    /// Memory limit passed to the engine (e.g. "512m", "2g")
    pub memory_limit: Option<String>,
    /// CPU quota in cores (e.g. 1.5)
    pub cpus: Option<f64>,
    /// Maximum number of processes inside the container
    pub pids_limit: Option<u32>,
    /// Network mode for new sandboxes
    pub network: NetworkMode,
    /// Working directory inside the container
    pub workdir: String,
    /// Command timeout in seconds
    pub exec_timeout_secs: u64,
    /// Per-stream output cap for exec results
    pub max_output_bytes: usize,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            memory_limit: None,
            cpus: None,
            pids_limit: None,
            network: NetworkMode::default(),
            workdir: "/workspace".to_string(),
            exec_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Default container image used when none is configured.
pub const DEFAULT_IMAGE: &str = "ubuntu:24.04";

/// Persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one JSON record per sandbox (default: data dir)
    pub dir: Option<PathBuf>,
}
