use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::types::SandboxDefaults;
use crate::engine::{ContainerEngine, Invocation};
use crate::sandbox::registry::SandboxRegistry;

/// Exit code reported when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the process could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// How long to keep draining pipes after the process exited. Background
/// children may hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Poll interval of the synchronous variant.
const BLOCKING_POLL: Duration = Duration::from_millis(10);

/// Extra seconds the in-container bound waits past the caller's timeout, so
/// the local deadline always fires first and reports the sentinel.
const IN_CONTAINER_GRACE_SECS: u64 = 2;

/// Where a command actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutedIn {
    Sandbox,
    Host,
}

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub executed_in: ExecutedIn,
}

impl CommandResult {
    /// True only for the timeout sentinel; never inferred from stderr.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options controlling exec behavior.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Relative paths are joined under the sandbox workdir
    pub cwd: Option<String>,
    pub timeout: Duration,
    /// Overlaid on the container (or host) environment
    pub env: Vec<(String, String)>,
    pub max_output_bytes: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: Duration::from_secs(300),
            env: Vec::new(),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl From<&SandboxDefaults> for ExecOptions {
    fn from(defaults: &SandboxDefaults) -> Self {
        Self {
            timeout: Duration::from_secs(defaults.exec_timeout_secs),
            max_output_bytes: defaults.max_output_bytes,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A line (including its trailing newline, if any) as it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

/// Capped byte sink shared between a pipe reader and the waiter.
struct OutputBuffer {
    data: Mutex<Vec<u8>>,
    max: usize,
}

impl OutputBuffer {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
            max,
        })
    }

    fn push(&self, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        // Keep one chunk past the cap so `finish` can tell output was cut
        if data.len() <= self.max {
            data.extend_from_slice(bytes);
        }
    }

    fn finish(&self) -> String {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        truncate_output(String::from_utf8_lossy(&data).into_owned(), self.max)
    }
}

fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn timeout_marker(timeout: Duration) -> String {
    format!("[taskbox] command timed out after {:?}", timeout)
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Wrap a sandbox command so the container kills it on its own once the
/// timeout (plus a grace) has passed. Killing the local engine client does
/// not reach processes inside the container. Images without `timeout` run
/// the command unbounded.
fn bounded_command(command: &str, timeout: Duration) -> String {
    let secs =
        timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0) + IN_CONTAINER_GRACE_SECS;
    let quoted = shell_quote(command);
    format!(
        "if command -v timeout >/dev/null 2>&1; then exec timeout -s KILL {secs} sh -c {quoted}; else exec sh -c {quoted}; fi"
    )
}

/// Kill the child and everything it spawned. Children are started as
/// process group leaders, so the group id is the child's pid.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, error = %e, "Failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Runs commands inside a task's sandbox, or on the host when it has none.
///
/// Resolution uses the registry's running-only lookup. Host fallback is
/// intentional and never reported as an error. Commands are not queued:
/// concurrent calls for the same task run concurrently.
pub struct CommandExecutor {
    registry: Arc<SandboxRegistry>,
    engine: Arc<dyn ContainerEngine>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<SandboxRegistry>, engine: Arc<dyn ContainerEngine>) -> Self {
        Self { registry, engine }
    }

    fn resolve(&self, task_id: &str, command: &str, opts: &ExecOptions) -> (Invocation, ExecutedIn) {
        match self.registry.find_running(task_id) {
            Some((resolved_id, instance)) => {
                let workdir = instance.resolve_workdir(opts.cwd.as_deref());
                debug!(
                    task_id = %task_id,
                    resolved_id = %resolved_id,
                    container = %instance.container_name,
                    workdir = %workdir,
                    "Executing command in sandbox"
                );
                let invocation = self.engine.exec_invocation(
                    &instance.container_name,
                    &workdir,
                    &opts.env,
                    &bounded_command(command, opts.timeout),
                );
                (invocation, ExecutedIn::Sandbox)
            }
            None => {
                debug!(task_id = %task_id, "No running sandbox, executing on host");
                let invocation = Invocation {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), command.to_string()],
                    envs: opts.env.clone(),
                    current_dir: opts.cwd.as_ref().map(PathBuf::from),
                };
                (invocation, ExecutedIn::Host)
            }
        }
    }

    /// Execute a command and collect its output.
    pub async fn exec(&self, task_id: &str, command: &str, opts: &ExecOptions) -> CommandResult {
        self.run(task_id, command, opts, None).await
    }

    /// Execute a command, forwarding output line by line to `sink` as it
    /// arrives. The returned result holds the full (capped) output.
    pub async fn exec_streaming(
        &self,
        task_id: &str,
        command: &str,
        opts: &ExecOptions,
        sink: mpsc::Sender<OutputChunk>,
    ) -> CommandResult {
        self.run(task_id, command, opts, Some(sink)).await
    }

    async fn run(
        &self,
        task_id: &str,
        command: &str,
        opts: &ExecOptions,
        sink: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        let (invocation, executed_in) = self.resolve(task_id, command, opts);
        let started = Instant::now();

        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(ref dir) = invocation.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failure(&invocation, e, started, executed_in),
        };

        let out = OutputBuffer::new(opts.max_output_bytes);
        let err = OutputBuffer::new(opts.max_output_bytes);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                OutputStream::Stdout,
                out.clone(),
                sink.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                OutputStream::Stderr,
                err.clone(),
                sink,
            )));
        }

        let waited = tokio::time::timeout(opts.timeout, child.wait()).await;

        let exit_code = match waited {
            Ok(Ok(status)) => {
                let drain = futures_join(&mut readers);
                if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                    debug!(task_id = %task_id, "Output pipes still open after exit, detaching");
                }
                status.code().unwrap_or(-1)
            }
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "Failed to wait for command");
                if let Some(pid) = child.id() {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                for reader in &readers {
                    reader.abort();
                }
                return CommandResult {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    stdout: out.finish(),
                    stderr: format!("failed to wait for {}: {}", invocation.program, e),
                    duration: started.elapsed(),
                    executed_in,
                };
            }
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    timeout_ms = opts.timeout.as_millis() as u64,
                    "Command timed out, killing it"
                );
                if let Some(pid) = child.id() {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                let _ = child.wait().await;
                for reader in &readers {
                    reader.abort();
                }
                return CommandResult {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: out.finish(),
                    stderr: timeout_marker(opts.timeout),
                    duration: started.elapsed(),
                    executed_in,
                };
            }
        };

        for reader in &readers {
            reader.abort();
        }

        let result = CommandResult {
            exit_code,
            stdout: out.finish(),
            stderr: err.finish(),
            duration: started.elapsed(),
            executed_in,
        };
        debug!(
            task_id = %task_id,
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Command completed"
        );
        result
    }

    /// Synchronous variant for call sites that cannot await.
    ///
    /// Same resolution, timeout and fallback semantics as [`Self::exec`], without
    /// streaming. Blocks the calling thread; from async code run it on a
    /// blocking thread.
    pub fn exec_blocking(&self, task_id: &str, command: &str, opts: &ExecOptions) -> CommandResult {
        let (invocation, executed_in) = self.resolve(task_id, command, opts);
        let started = Instant::now();

        let mut cmd = std::process::Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(ref dir) = invocation.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failure(&invocation, e, started, executed_in),
        };

        let out = OutputBuffer::new(opts.max_output_bytes);
        let err = OutputBuffer::new(opts.max_output_bytes);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let buf = out.clone();
            readers.push(std::thread::spawn(move || pump_blocking(stdout, &buf)));
        }
        if let Some(stderr) = child.stderr.take() {
            let buf = err.clone();
            readers.push(std::thread::spawn(move || pump_blocking(stderr, &buf)));
        }

        let deadline = started + opts.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => {
                    warn!(task_id = %task_id, "Command timed out, killing it");
                    kill_process_group(child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                Ok(None) => std::thread::sleep(BLOCKING_POLL),
                Err(e) => {
                    kill_process_group(child.id());
                    let _ = child.kill();
                    return CommandResult {
                        exit_code: SPAWN_FAILURE_EXIT_CODE,
                        stdout: out.finish(),
                        stderr: format!("failed to wait for {}: {}", invocation.program, e),
                        duration: started.elapsed(),
                        executed_in,
                    };
                }
            }
        };

        let Some(status) = status else {
            // Reader threads are detached; they end when the pipes close
            return CommandResult {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: out.finish(),
                stderr: timeout_marker(opts.timeout),
                duration: started.elapsed(),
                executed_in,
            };
        };

        let drain_deadline = Instant::now() + DRAIN_GRACE;
        while readers.iter().any(|r| !r.is_finished()) && Instant::now() < drain_deadline {
            std::thread::sleep(BLOCKING_POLL);
        }

        CommandResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: out.finish(),
            stderr: err.finish(),
            duration: started.elapsed(),
            executed_in,
        }
    }
}

fn spawn_failure(
    invocation: &Invocation,
    error: std::io::Error,
    started: Instant,
    executed_in: ExecutedIn,
) -> CommandResult {
    warn!(program = %invocation.program, error = %error, "Failed to spawn command");
    CommandResult {
        exit_code: SPAWN_FAILURE_EXIT_CODE,
        stdout: String::new(),
        stderr: format!("failed to spawn {}: {}", invocation.program, error),
        duration: started.elapsed(),
        executed_in,
    }
}

async fn futures_join(readers: &mut [tokio::task::JoinHandle<()>]) {
    for reader in readers.iter_mut() {
        let _ = reader.await;
    }
}

async fn pump<R>(
    reader: R,
    stream: OutputStream,
    buf: Arc<OutputBuffer>,
    sink: Option<mpsc::Sender<OutputChunk>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                buf.push(&line);
                if let Some(ref tx) = sink {
                    let chunk = OutputChunk {
                        stream,
                        data: String::from_utf8_lossy(&line).into_owned(),
                    };
                    // A dropped receiver only stops forwarding, not collection
                    let _ = tx.send(chunk).await;
                }
            }
        }
    }
}

fn pump_blocking<R: Read>(mut reader: R, buf: &OutputBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.push(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output_on_char_boundary() {
        let text = "héllo".to_string();
        // 'é' is two bytes starting at index 1; cutting at 2 must back off to 1
        let cut = truncate_output(text, 2);
        assert!(cut.starts_with('h'));
        assert!(cut.ends_with("[output truncated]"));
        assert_eq!(truncate_output("short".to_string(), 10), "short");
    }

    #[test]
    fn test_output_buffer_caps_growth() {
        let buf = OutputBuffer::new(4);
        buf.push(b"abc");
        buf.push(b"defgh");
        buf.push(b"ignored");
        let text = buf.finish();
        assert_eq!(text, format!("abcd{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_bounded_command_outlives_local_timeout() {
        let wrapped = bounded_command("echo 'hi'", Duration::from_millis(200));
        assert!(wrapped.contains("timeout -s KILL 3 sh -c 'echo '\\''hi'\\'''"));
        assert!(wrapped.contains("else exec sh -c 'echo '\\''hi'\\'''"));

        let wrapped = bounded_command("true", Duration::from_secs(30));
        assert!(wrapped.contains("timeout -s KILL 32 sh -c 'true'"));
    }

    #[test]
    fn test_bounded_command_runs_in_sh() {
        let wrapped = bounded_command("printf '%s' \"$X\"; exit 4", Duration::from_secs(5));
        let output = std::process::Command::new("sh")
            .args(["-c", &wrapped])
            .env("X", "it's")
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(4));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "it's");
    }

    #[test]
    fn test_timed_out_is_sentinel_only() {
        let result = CommandResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: timeout_marker(Duration::from_secs(1)),
            duration: Duration::ZERO,
            executed_in: ExecutedIn::Host,
        };
        assert!(!result.timed_out());
    }
}
