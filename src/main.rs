use clap::Parser;

use taskbox::cli::args::{Cli, Commands};
use taskbox::cli::commands;
use taskbox::config::loader::load_config;
use taskbox::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    let config_path = cli.global_opts.config.as_deref();
    let format = cli.global_opts.format;

    // Writing a config must work even when the current one is broken
    if let Commands::Init(args) = cli.command {
        return commands::init(args, config_path).await;
    }

    let config = load_config(config_path)?;

    // Dispatch to subcommand handler
    match cli.command {
        Commands::Create(args) => {
            commands::create(args, config, format).await?;
        }
        Commands::Exec(args) => {
            commands::exec(args, config, format).await?;
        }
        Commands::Destroy(args) => {
            commands::destroy(args, config, format).await?;
        }
        Commands::Resume(args) => {
            commands::resume(args, config, format).await?;
        }
        Commands::List => {
            commands::list(config, format).await?;
        }
        Commands::Status => {
            commands::status(config, format).await?;
        }
        Commands::Ports(args) => {
            commands::ports(args, config, format).await?;
        }
        Commands::Sweep => {
            commands::sweep(config, format).await?;
        }
        Commands::Config(args) => {
            commands::config(args, config, config_path).await?;
        }
        Commands::Init(_) => {}
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
