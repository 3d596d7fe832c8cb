use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::sandbox::{NetworkMode, PortSpec, SandboxRole, VolumeMount};

#[derive(Parser, Debug)]
#[clap(name = "taskbox")]
#[clap(version, about = "Per-task container sandboxes for agent-generated commands")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "TASKBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create (or reuse) the sandbox for a task
    Create(CreateArgs),

    /// Execute a command in a task's sandbox, or on the host if it has none
    Exec(ExecArgs),

    /// Stop and remove a task's sandbox
    Destroy(TaskArgs),

    /// Adopt and restart an existing container for a task
    Resume(ResumeArgs),

    /// List tracked sandboxes
    List,

    /// Show engine availability and active sandbox count
    Status,

    /// Show published port mappings of a task's sandbox
    Ports(TaskArgs),

    /// Remove managed containers that have no record
    Sweep,

    /// Initialize a new taskbox configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Sandbox Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Task identifier
    pub task_id: String,

    /// Host workspace mounted at the workdir when no --mount is given
    #[clap(long, short = 'w', default_value = ".")]
    pub workspace: PathBuf,

    /// Container image (overrides the configured default)
    #[clap(long, short = 'i')]
    pub image: Option<String>,

    /// Mount host directories into the sandbox (host_path:container_path[:ro])
    #[clap(long = "mount", short = 'm')]
    pub mounts: Vec<VolumeMount>,

    /// Publish a port (hostPort:containerPort, 0:containerPort or containerPort)
    #[clap(long = "port", short = 'p')]
    pub ports: Vec<PortSpec>,

    /// Environment variables to set in the sandbox (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Network mode (defaults to the configured one)
    #[clap(long, value_enum)]
    pub network: Option<NetworkMode>,

    /// Memory limit (e.g. 512m, 2g)
    #[clap(long)]
    pub memory: Option<String>,

    /// CPU quota in cores
    #[clap(long)]
    pub cpus: Option<f64>,

    /// Maximum number of processes
    #[clap(long)]
    pub pids_limit: Option<u32>,

    /// Working directory inside the sandbox
    #[clap(long)]
    pub workdir: Option<String>,

    /// Repository name stored with the sandbox
    #[clap(long)]
    pub repository: Option<String>,

    /// Role tag stored with the sandbox
    #[clap(long, value_enum)]
    pub role: Option<SandboxRole>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Task identifier
    pub task_id: String,

    /// Command to execute (run through `sh -c`)
    pub command: String,

    /// Working directory; relative paths resolve under the sandbox workdir
    #[clap(long)]
    pub cwd: Option<String>,

    /// Timeout in seconds (defaults to the configured one)
    #[clap(long, short = 't')]
    pub timeout: Option<u64>,

    /// Environment variables for this command (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Print output as it is produced
    #[clap(long)]
    pub stream: bool,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Task identifier
    pub task_id: String,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Task identifier
    pub task_id: String,

    /// Host workspace recorded when no persisted record exists
    #[clap(long, short = 'w', default_value = ".")]
    pub workspace: PathBuf,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err("Environment variable format: KEY=VALUE".to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "taskbox", "create", "t1", "-m", "/ws/a:/workspace/a:ro", "-p", "0:3000", "-e",
            "A=1", "--network", "bridged", "--role", "frontend",
        ])
        .unwrap();

        let Commands::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.task_id, "t1");
        assert!(args.mounts[0].readonly);
        assert_eq!(args.ports[0].container_port, 3000);
        assert_eq!(args.env_vars, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(args.network, Some(NetworkMode::Bridged));
        assert_eq!(args.role, Some(SandboxRole::Frontend));
    }

    #[test]
    fn test_parse_exec_with_globals() {
        let cli = Cli::try_parse_from([
            "taskbox", "exec", "t1", "echo hi", "--timeout", "5", "-vv", "--format", "json",
        ])
        .unwrap();

        assert_eq!(cli.global_opts.verbose, 2);
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
        let Commands::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.command, "echo hi");
        assert_eq!(args.timeout, Some(5));
    }

    #[test]
    fn test_rejects_bad_env_and_port() {
        assert!(Cli::try_parse_from(["taskbox", "create", "t1", "-e", "NOVALUE"]).is_err());
        assert!(Cli::try_parse_from(["taskbox", "create", "t1", "-p", "x:1"]).is_err());
    }
}
