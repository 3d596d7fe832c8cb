use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::types::EngineConfig;
use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, Invocation, TASK_LABEL,
};
use crate::error::{Result, TaskboxError};
use crate::sandbox::NetworkMode;

/// Go template for `inspect`, one `|`-separated line per container.
const INSPECT_FORMAT: &str =
    "{{.Id}}|{{.Name}}|{{.State.Status}}|{{.Config.Image}}|{{.Config.WorkingDir}}";

/// Convenience install script used by the best-effort Linux install.
const DOCKER_INSTALL_SCRIPT: &str = "https://get.docker.com";

/// Docker-compatible container engine driven through its CLI.
///
/// Every call is a separate `tokio::process` invocation bounded by a timeout
/// from [`EngineConfig`]; process and engine failures are turned into
/// [`TaskboxError`] values here and never escape as panics.
pub struct DockerCli {
    config: EngineConfig,
}

impl DockerCli {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run an engine command to completion within `timeout`.
    async fn output(&self, args: &[String], operation: &str, timeout: Duration) -> Result<Output> {
        debug!(binary = %self.config.binary, ?args, "Running engine command");

        let mut cmd = self.command();
        cmd.args(args);
        bounded_output(cmd, &self.config.binary, operation, timeout).await
    }

    /// Like [`Self::output`], but a non-zero exit becomes an error carrying stderr.
    async fn checked(&self, args: &[String], operation: &str, timeout: Duration) -> Result<String> {
        let output = self.output(args, operation, timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskboxError::engine(operation, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn succeeds(&self, program: &str, args: &[&str]) -> bool {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.config.inspect_timeout(), cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

/// Build the `run` arguments for a sandbox container.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--init".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--label".to_string(),
        format!("{}={}", TASK_LABEL, spec.task_id),
        format!("--network={}", spec.network.engine_value()),
    ];

    // Resource limits
    if let Some(ref mem) = spec.memory_limit {
        args.extend(["--memory".to_string(), mem.clone()]);
    }
    if let Some(cpus) = spec.cpus {
        args.extend(["--cpus".to_string(), cpus.to_string()]);
    }
    if let Some(pids) = spec.pids_limit {
        args.extend(["--pids-limit".to_string(), pids.to_string()]);
    }

    // Environment variables
    for (key, value) in &spec.env {
        args.extend(["-e".to_string(), format!("{}={}", key, value)]);
    }

    // Published ports only make sense on a bridged network
    if spec.network == NetworkMode::Bridged {
        for port in &spec.ports {
            args.extend(["-p".to_string(), port.engine_value()]);
        }
    }

    // Mount directories
    for mount in &spec.mounts {
        args.extend(["-v".to_string(), mount.engine_value()]);
    }

    // Working directory
    args.extend(["-w".to_string(), spec.workdir.clone()]);

    // Image and command to keep container running
    args.push(spec.image.clone());
    args.extend(["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]);

    args
}

/// Parse one line produced by [`INSPECT_FORMAT`].
pub fn parse_inspect_line(line: &str) -> Option<ContainerInfo> {
    let mut fields = line.trim().splitn(5, '|');
    let id = fields.next()?.trim();
    let name = fields.next()?.trim().trim_start_matches('/');
    let state = fields.next()?;
    let image = fields.next()?.trim();
    let workdir = fields.next().unwrap_or_default().trim();

    if id.is_empty() || name.is_empty() {
        return None;
    }

    Some(ContainerInfo {
        id: id.to_string(),
        name: name.to_string(),
        state: ContainerState::parse(state),
        image: image.to_string(),
        workdir: workdir.to_string(),
    })
}

/// Run `cmd` to completion, killing it once `timeout` elapses.
async fn bounded_output(
    mut cmd: Command,
    program: &str,
    operation: &str,
    timeout: Duration,
) -> Result<Output> {
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(TaskboxError::engine(
            operation,
            format!("failed to run {}: {}", program, e),
        )),
        Err(_) => Err(TaskboxError::EngineTimeout {
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such object") || stderr.contains("no such container")
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.config.binary
    }

    async fn cli_installed(&self) -> bool {
        which::which(&self.config.binary).is_ok()
    }

    async fn install(&self) -> Result<()> {
        if self.config.binary != "docker" {
            return Err(TaskboxError::engine(
                "install",
                format!("automatic install is not supported for {}", self.config.binary),
            ));
        }

        info!(os = std::env::consts::OS, "Attempting to install docker");

        let (program, args): (&str, Vec<String>) = match std::env::consts::OS {
            "linux" => (
                "sh",
                vec![
                    "-c".to_string(),
                    format!("curl -fsSL {} | sh", DOCKER_INSTALL_SCRIPT),
                ],
            ),
            "macos" => (
                "brew",
                vec![
                    "install".to_string(),
                    "--cask".to_string(),
                    "docker".to_string(),
                ],
            ),
            other => {
                return Err(TaskboxError::engine(
                    "install",
                    format!("unsupported platform: {}", other),
                ))
            }
        };

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let timeout = self.config.install_timeout();
        let output = bounded_output(cmd, program, "install", timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskboxError::engine("install", stderr.trim()));
        }

        info!("Docker installed");
        Ok(())
    }

    async fn daemon_ready(&self) -> bool {
        self.succeeds(&self.config.binary, &["info", "--format", "{{.ServerVersion}}"])
            .await
    }

    async fn start_daemon(&self) -> Result<()> {
        let binary = self.config.binary.as_str();
        let attempts: Vec<(&str, Vec<&str>)> = match (std::env::consts::OS, binary) {
            ("linux", "docker") => vec![
                ("systemctl", vec!["start", "docker"]),
                ("sudo", vec!["-n", "systemctl", "start", "docker"]),
                ("service", vec!["docker", "start"]),
            ],
            ("macos", "docker") => vec![("open", vec!["-a", "Docker"])],
            ("macos", "podman") => vec![("podman", vec!["machine", "start"])],
            _ => Vec::new(),
        };

        for (program, args) in &attempts {
            if self.succeeds(program, args).await {
                info!(program = %program, "Requested container daemon start");
                return Ok(());
            }
            debug!(program = %program, "Daemon start attempt failed");
        }

        Err(TaskboxError::engine(
            "start daemon",
            format!(
                "no start method succeeded for {} on {}",
                binary,
                std::env::consts::OS
            ),
        ))
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        let args = run_args(spec);
        info!(container = %spec.name, image = %spec.image, "Starting sandbox container");

        let stdout = self
            .checked(&args, "run", self.config.create_timeout())
            .await?;

        let container_id = stdout.trim().lines().last().unwrap_or_default().to_string();
        if container_id.is_empty() {
            return Err(TaskboxError::engine("run", "engine returned no container id"));
        }
        Ok(container_id)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            INSPECT_FORMAT.to_string(),
            name.to_string(),
        ];
        let output = self
            .output(&args, "inspect", self.config.inspect_timeout())
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(TaskboxError::engine("inspect", stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().find_map(parse_inspect_line) {
            Some(info) => Ok(Some(info)),
            None => Err(TaskboxError::engine(
                "inspect",
                format!("unexpected inspect output: {}", stdout.trim()),
            )),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        let args = vec!["start".to_string(), name.to_string()];
        self.checked(&args, "start", self.config.inspect_timeout())
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            name.to_string(),
        ];
        // The engine escalates to SIGKILL after the grace period
        let timeout = grace + self.config.inspect_timeout();
        let output = self.output(&args, "stop", timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(());
            }
            return Err(TaskboxError::engine("stop", stderr.trim()));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = self
            .output(&args, "remove", self.config.inspect_timeout())
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(());
            }
            warn!(container = %name, error = %stderr.trim(), "Failed to remove container");
            return Err(TaskboxError::engine("remove", stderr.trim()));
        }
        Ok(())
    }

    async fn port_table(&self, container: &str) -> Result<String> {
        let args = vec!["port".to_string(), container.to_string()];
        self.checked(&args, "port", self.config.inspect_timeout())
            .await
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name={}-", prefix),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let stdout = self
            .checked(&args, "list", self.config.inspect_timeout())
            .await?;

        // The engine's name filter is a substring match, so re-check the prefix
        let wanted = format!("{}-", prefix);
        Ok(stdout
            .lines()
            .map(|l| l.trim().trim_start_matches('/'))
            .filter(|name| name.starts_with(&wanted))
            .map(str::to_string)
            .collect())
    }

    fn exec_invocation(
        &self,
        container: &str,
        workdir: &str,
        env: &[(String, String)],
        command: &str,
    ) -> Invocation {
        let mut args = vec!["exec".to_string(), "-w".to_string(), workdir.to_string()];

        for (key, value) in env {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }

        args.push(container.to_string());
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);

        Invocation {
            program: self.config.binary.clone(),
            args,
            envs: Vec::new(),
            current_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{PortSpec, VolumeMount};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "taskbox-0123456789abcdef".to_string(),
            task_id: "t1".to_string(),
            image: "node:20".to_string(),
            memory_limit: Some("512m".to_string()),
            cpus: Some(1.5),
            pids_limit: Some(256),
            network: NetworkMode::Bridged,
            env: vec![("CI".to_string(), "1".to_string())],
            ports: vec![
                PortSpec {
                    host_port: None,
                    container_port: 3000,
                },
                PortSpec {
                    host_port: Some(8080),
                    container_port: 80,
                },
            ],
            mounts: vec![
                VolumeMount::new("/ws/a", "/workspace/a"),
                VolumeMount {
                    readonly: true,
                    ..VolumeMount::new("/ws/b", "/workspace/b")
                },
            ],
            workdir: "/workspace".to_string(),
        }
    }

    #[test]
    fn test_run_args_full() {
        let args = run_args(&spec());
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--init",
                "--name",
                "taskbox-0123456789abcdef",
                "--label",
                "taskbox.task-id=t1",
                "--network=bridge",
                "--memory",
                "512m",
                "--cpus",
                "1.5",
                "--pids-limit",
                "256",
                "-e",
                "CI=1",
                "-p",
                "3000",
                "-p",
                "8080:80",
                "-v",
                "/ws/a:/workspace/a:rw",
                "-v",
                "/ws/b:/workspace/b:ro",
                "-w",
                "/workspace",
                "node:20",
                "tail",
                "-f",
                "/dev/null",
            ]
        );
    }

    #[test]
    fn test_run_args_isolated_drops_ports() {
        let mut spec = spec();
        spec.network = NetworkMode::Isolated;
        let args = run_args(&spec);
        assert!(args.contains(&"--network=none".to_string()));
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn test_parse_inspect_line() {
        let info =
            parse_inspect_line("abc123|/taskbox-0123456789abcdef|exited|node:20|/workspace\n")
                .unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "taskbox-0123456789abcdef");
        assert_eq!(info.state, ContainerState::Exited);
        assert_eq!(info.image, "node:20");
        assert_eq!(info.workdir, "/workspace");
    }

    #[test]
    fn test_parse_inspect_line_rejects_garbage() {
        assert!(parse_inspect_line("").is_none());
        assert!(parse_inspect_line("no separators here").is_none());
        assert!(parse_inspect_line("|name|running|img|/").is_none());
    }

    #[test]
    fn test_exec_invocation() {
        let engine = DockerCli::new(EngineConfig::default());
        let inv = engine.exec_invocation(
            "taskbox-0123456789abcdef",
            "/workspace/api",
            &[("NODE_ENV".to_string(), "test".to_string())],
            "npm test",
        );
        assert_eq!(inv.program, "docker");
        assert_eq!(
            inv.args,
            vec![
                "exec",
                "-w",
                "/workspace/api",
                "-e",
                "NODE_ENV=test",
                "taskbox-0123456789abcdef",
                "sh",
                "-c",
                "npm test",
            ]
        );
        assert!(inv.envs.is_empty());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("Error: No such object: taskbox-x"));
        assert!(is_not_found("Error: no such container \"taskbox-x\""));
        assert!(!is_not_found("permission denied while trying to connect"));
    }

    #[tokio::test]
    async fn test_bounded_output_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5").kill_on_drop(true);

        let started = std::time::Instant::now();
        let err = bounded_output(cmd, "sleep", "install", Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            TaskboxError::EngineTimeout { ref operation, .. } if operation == "install"
        ));
    }

    #[test]
    fn test_install_timeout_default() {
        assert_eq!(
            EngineConfig::default().install_timeout(),
            Duration::from_secs(600)
        );
    }
}
