//! vmorch CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vmorch::config::OrchConfig;

mod cli;

/// vmorch - VM and container lifecycle orchestration
#[derive(Parser, Debug)]
#[command(name = "vmorch")]
#[command(about = "VM and container lifecycle orchestration")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: cli::GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage VMs.
    #[command(subcommand)]
    Vm(cli::vm::VmCmd),

    /// Manage containers inside a VM.
    #[command(subcommand)]
    Container(cli::container::ContainerCmd),

    /// Share a host path into a VM.
    Share(cli::share::ShareCmd),

    /// Stop sharing a host path.
    Unshare(cli::share::UnshareCmd),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.global.json_logs);

    tracing::debug!(version = vmorch::VERSION, "starting vmorch");

    let config = match cli.global.load_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            let mut config = OrchConfig::default();
            if let Some(socket) = &cli.global.socket {
                config.bus_socket = socket.clone();
            }
            config
        }
    };

    let result = match cli.command {
        Commands::Vm(cmd) => cmd.run(&cli.global, &config).await,
        Commands::Container(cmd) => cmd.run(&cli.global, &config).await,
        Commands::Share(cmd) => cmd.run(&cli.global, &config).await,
        Commands::Unshare(cmd) => cmd.run(&cli.global, &config).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmorch=warn"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
