use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cli::args::{
    ConfigAction, ConfigArgs, CreateArgs, ExecArgs, InitArgs, OutputFormat, ResumeArgs, TaskArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::TaskboxConfig;
use crate::error::{Result, TaskboxError};
use crate::sandbox::{
    CommandResult, ExecOptions, IdentityHints, OutputChunk, OutputStream, SandboxConfig,
    SandboxInstance, SandboxManager,
};

/// Build a manager and reconcile it with persisted records, so every
/// command sees the sandboxes earlier invocations left behind.
async fn open_manager(config: &TaskboxConfig) -> SandboxManager {
    let manager = SandboxManager::new(config);
    let report = manager.load_from_persistence().await;
    info!(
        engine_available = report.engine_available,
        adopted = report.adopted,
        restarted = report.restarted,
        removed = report.removed,
        "Loaded sandboxes"
    );
    manager
}

// ============================================================================
// Sandbox Commands
// ============================================================================

/// Create (or reuse) a task sandbox
pub async fn create(args: CreateArgs, config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    info!(task_id = %args.task_id, "Creating sandbox");

    let manager = open_manager(&config).await;
    let workspace = std::path::absolute(&args.workspace)?;

    let defaults = &config.defaults;
    let sandbox_config = SandboxConfig {
        image: defaults.image.clone(),
        memory_limit: args.memory.or_else(|| defaults.memory_limit.clone()),
        cpus: args.cpus.or(defaults.cpus),
        pids_limit: args.pids_limit.or(defaults.pids_limit),
        network: args.network.unwrap_or(defaults.network),
        env: args.env_vars,
        ports: args.ports,
        mounts: args.mounts,
        workdir: args.workdir.unwrap_or_else(|| defaults.workdir.clone()),
    };
    let hints = IdentityHints {
        repository: args.repository,
        role: args.role,
    };

    let instance = manager
        .create_sandbox(
            &args.task_id,
            &workspace,
            args.image.as_deref(),
            sandbox_config,
            hints,
        )
        .await?;

    match format {
        OutputFormat::Text => println!("{}", instance.container_name),
        OutputFormat::Json => println!("{}", instance_json(&instance)),
    }

    Ok(())
}

/// Execute a command for a task
pub async fn exec(args: ExecArgs, config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    info!(task_id = %args.task_id, command = %args.command, "Executing command");

    let manager = open_manager(&config).await;

    let mut opts = ExecOptions::from(&config.defaults);
    opts.cwd = args.cwd;
    opts.env = args.env_vars;
    if let Some(secs) = args.timeout {
        opts.timeout = Duration::from_secs(secs);
    }

    if args.stream && matches!(format, OutputFormat::Text) {
        let (tx, printer) = spawn_printer();
        let result = manager
            .exec_streaming(&args.task_id, &args.command, &opts, tx)
            .await;
        let _ = printer.await;
        if result.timed_out() {
            eprintln!("{}", result.stderr);
        }
        exit_with(&result);
        return Ok(());
    }

    let result = manager.exec(&args.task_id, &args.command, &opts).await;
    output_command_result(&result, format);

    Ok(())
}

/// Destroy a task sandbox
pub async fn destroy(args: TaskArgs, config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    info!(task_id = %args.task_id, "Destroying sandbox");

    let manager = open_manager(&config).await;
    let destroyed = manager.destroy_sandbox(&args.task_id).await;

    match format {
        OutputFormat::Text => {
            if destroyed {
                println!("Sandbox for '{}' destroyed", args.task_id);
            } else {
                println!("No sandbox for '{}'", args.task_id);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "task_id": args.task_id,
                    "destroyed": destroyed,
                })
            );
        }
    }

    Ok(())
}

/// Adopt an existing container for a task
pub async fn resume(args: ResumeArgs, config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    let manager = open_manager(&config).await;
    let workspace = std::path::absolute(&args.workspace)?;
    let instance = manager.find_or_start_existing(&args.task_id, &workspace).await;

    match (format, instance) {
        (OutputFormat::Text, Some(instance)) => println!("{}", instance.container_name),
        (OutputFormat::Text, None) => println!("No resumable sandbox for '{}'", args.task_id),
        (OutputFormat::Json, Some(instance)) => println!("{}", instance_json(&instance)),
        (OutputFormat::Json, None) => println!("null"),
    }

    Ok(())
}

/// List tracked sandboxes
pub async fn list(config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    let manager = open_manager(&config).await;
    let sandboxes = manager.all_sandboxes();

    match format {
        OutputFormat::Text => {
            if sandboxes.is_empty() {
                println!("No sandboxes");
            } else {
                println!(
                    "{:<20} {:<26} {:<9} {:<17} IMAGE",
                    "TASK", "CONTAINER", "STATUS", "CREATED"
                );
                println!("{}", "-".repeat(90));

                for sandbox in sandboxes {
                    let created = sandbox
                        .created_at
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M")
                        .to_string();
                    println!(
                        "{:<20} {:<26} {:<9} {:<17} {}",
                        sandbox.task_id,
                        sandbox.container_name,
                        sandbox.status.to_string(),
                        created,
                        sandbox.image
                    );
                }
            }
        }
        OutputFormat::Json => {
            let json: Vec<_> = sandboxes.iter().map(instance_json).collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }

    Ok(())
}

/// Show engine availability
pub async fn status(config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    let manager = open_manager(&config).await;
    let status = manager.get_status().await;

    match format {
        OutputFormat::Text => {
            println!(
                "engine:    {} ({})",
                config.engine.binary,
                if status.engine_available {
                    "available"
                } else {
                    "unavailable"
                }
            );
            println!("sandboxes: {} running", status.active_sandboxes);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&status)?),
    }

    Ok(())
}

/// Show port mappings
pub async fn ports(args: TaskArgs, config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    let manager = open_manager(&config).await;
    let ports = manager.resolve_mapped_ports(&args.task_id).await;

    match format {
        OutputFormat::Text => match ports {
            Some(ports) if !ports.is_empty() => {
                for (container, host) in ports {
                    println!("{} -> {}", container, host);
                }
            }
            Some(_) => println!("No published ports"),
            None => println!("No running sandbox for '{}'", args.task_id),
        },
        OutputFormat::Json => println!("{}", serde_json::to_string(&ports)?),
    }

    Ok(())
}

/// Remove orphaned containers
pub async fn sweep(config: TaskboxConfig, format: OutputFormat) -> Result<()> {
    let manager = open_manager(&config).await;
    let report = manager.sweep_orphans().await?;

    match format {
        OutputFormat::Text => {
            for name in &report.removed {
                println!("removed {}", name);
            }
            for name in &report.failed {
                eprintln!("failed  {}", name);
            }
            println!(
                "{} removed, {} kept, {} failed",
                report.removed.len(),
                report.kept,
                report.failed.len()
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs, config_path: Option<&Path>) -> Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(get_config_path);

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    // Create parent directories if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = TaskboxConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| TaskboxError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Create a sandbox for a task, mounting the current directory");
    println!("  taskbox create task-1 --workspace .");
    println!();
    println!("  # Run commands in it");
    println!("  taskbox exec task-1 \"ls -la\"");
    println!();
    println!("  # Destroy it when the task is done");
    println!("  taskbox destroy task-1");

    Ok(())
}

pub async fn config(
    args: ConfigArgs,
    config: TaskboxConfig,
    config_path: Option<&Path>,
) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| TaskboxError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            let path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(get_config_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn instance_json(instance: &SandboxInstance) -> serde_json::Value {
    serde_json::json!({
        "task_id": instance.task_id,
        "container_id": instance.container_id,
        "container_name": instance.container_name,
        "image": instance.image,
        "workspace_path": instance.workspace_path,
        "status": instance.status,
        "created_at": instance.created_at,
        "mapped_ports": instance.mapped_ports(),
        "repository": instance.repository,
        "role": instance.role,
    })
}

/// Spawn a task that prints streamed chunks to stdout or stderr as they arrive.
/// It finishes once every sender is dropped.
fn spawn_printer() -> (mpsc::Sender<OutputChunk>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OutputChunk>(256);
    let printer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => print!("{}", chunk.data),
                OutputStream::Stderr => eprint!("{}", chunk.data),
            }
        }
    });
    (tx, printer)
}

/// Exit with the command's exit code, mirroring it to the caller's shell.
fn exit_with(result: &CommandResult) {
    if result.exit_code != 0 {
        let _ = std::io::stdout().flush();
        std::process::exit(result.exit_code);
    }
}

fn output_command_result(result: &CommandResult, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
            exit_with(result);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "exit_code": result.exit_code,
                    "timed_out": result.timed_out(),
                    "duration_ms": result.duration.as_millis() as u64,
                    "executed_in": result.executed_in,
                })
            );
        }
    }
}
