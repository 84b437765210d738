//! Container commands.
//!
//! Each command builds handles for an already running VM; the VM itself is
//! started with `vmorch vm start`.

use super::GlobalArgs;
use clap::{Args, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio_stream::StreamExt;
use vmorch::config::{ImageChannel, OrchConfig};
use vmorch::{Container, CreationWatcher, ImageSource, Session, Vm};

/// Container management commands
#[derive(Subcommand, Debug)]
pub enum ContainerCmd {
    /// Create a container from an image
    Create(ContainerCreateCmd),

    /// Start a container, set up its user and wait until it is ready
    Start(ContainerStartCmd),

    /// Set up the default user in a container
    SetupUser(ContainerSetupUserCmd),

    /// Install a package file already inside the container
    Install(ContainerInstallCmd),

    /// Uninstall the package owning a desktop file
    Uninstall(ContainerUninstallCmd),

    /// Copy a local file into a container
    Push(ContainerPushCmd),

    /// Execute a command in a container
    Exec(ContainerExecCmd),

    /// Write the container's system journal to a file
    Logs(ContainerLogsCmd),
}

impl ContainerCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        match self {
            ContainerCmd::Create(cmd) => cmd.run(global, config).await,
            ContainerCmd::Start(cmd) => cmd.run(global, config).await,
            ContainerCmd::SetupUser(cmd) => cmd.run(global, config).await,
            ContainerCmd::Install(cmd) => cmd.run(global, config).await,
            ContainerCmd::Uninstall(cmd) => cmd.run(global, config).await,
            ContainerCmd::Push(cmd) => cmd.run(global, config).await,
            ContainerCmd::Exec(cmd) => cmd.run(global, config).await,
            ContainerCmd::Logs(cmd) => cmd.run(global, config).await,
        }
    }
}

/// Which container a command addresses.
#[derive(Args, Debug)]
pub struct ContainerTarget {
    /// VM name (defaults to the configured VM)
    #[arg(long)]
    pub vm: Option<String>,

    /// Container name (defaults to the configured container)
    #[arg(long)]
    pub name: Option<String>,

    /// Container user (defaults to the configured user)
    #[arg(long)]
    pub user: Option<String>,
}

impl ContainerTarget {
    fn container(&self, session: Session) -> Container {
        let config = session.config().clone();
        let vm_name = self.vm.clone().unwrap_or(config.vm_name);
        let vm = Vm::new(session, vm_name, false, 0);
        Container::new(
            &vm,
            self.name.clone().unwrap_or(config.container_name),
            self.user.clone().unwrap_or(config.container_user),
        )
    }
}

// ============================================================================
// Create
// ============================================================================

/// Create a container from an image
#[derive(Args, Debug)]
pub struct ContainerCreateCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Image channel (live or staging)
    #[arg(long)]
    pub channel: Option<ImageChannel>,

    /// Milestone of the image server
    #[arg(long)]
    pub milestone: Option<u32>,

    /// Image alias
    #[arg(long)]
    pub alias: Option<String>,

    /// Print image download progress
    #[arg(long)]
    pub progress: bool,
}

impl ContainerCreateCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.create());

        let mut image = ImageSource::from_config(config);
        if let Some(channel) = self.channel {
            image.channel = channel;
        }
        if let Some(milestone) = self.milestone {
            image.milestone = milestone;
        }
        if let Some(alias) = self.alias {
            image.alias = alias;
        }

        if !self.progress {
            container.create(&ctx, &image).await?;
            println!("Created container '{}'", container.name());
            return Ok(());
        }

        let mut watcher = CreationWatcher::new(&container).await?;
        let create = container.create(&ctx, &image);
        tokio::pin!(create);

        let mut watching = true;
        let result = loop {
            tokio::select! {
                result = &mut create => break result,
                progress = watcher.wait_for_download(&ctx, -1), if watching => match progress {
                    Ok(pct) => {
                        print!("\rDownloading image: {:>3}%", pct);
                        let _ = std::io::stdout().flush();
                    }
                    Err(e) => {
                        // The create wait reports the terminal outcome.
                        tracing::debug!(error = %e, "stopped watching download");
                        watching = false;
                    }
                },
            }
        };
        println!();

        if let Err(e) = watcher.close().await {
            tracing::warn!(error = %e, "failed to release creation watcher");
        }
        result?;
        println!("Created container '{}'", container.name());
        Ok(())
    }
}

// ============================================================================
// Start
// ============================================================================

/// Start a container and wait until it is ready
#[derive(Args, Debug)]
pub struct ContainerStartCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Directory for the container log written on failure
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl ContainerStartCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.start());
        let log_dir = self.log_dir.unwrap_or_else(|| config.log_dir.clone());

        container.start_and_wait(&ctx, &log_dir).await?;
        println!("Container '{}' is ready", container.name());
        Ok(())
    }
}

/// Set up the default user
#[derive(Args, Debug)]
pub struct ContainerSetupUserCmd {
    #[command(flatten)]
    pub target: ContainerTarget,
}

impl ContainerSetupUserCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.command());

        container.set_up_user(&ctx).await?;
        println!("User '{}' is set up", container.user());
        Ok(())
    }
}

// ============================================================================
// Packages
// ============================================================================

/// Install a package
#[derive(Args, Debug)]
pub struct ContainerInstallCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Package file path inside the container
    pub file: String,
}

impl ContainerInstallCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.package());

        container.install_package(&ctx, &self.file).await?;
        println!("Installed {}", self.file);
        Ok(())
    }
}

/// Uninstall a package
#[derive(Args, Debug)]
pub struct ContainerUninstallCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Desktop file id owned by the package
    pub desktop_file_id: String,
}

impl ContainerUninstallCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.package());

        container
            .uninstall_package_owning_file(&ctx, &self.desktop_file_id)
            .await?;
        println!("Uninstalled package owning {}", self.desktop_file_id);
        Ok(())
    }
}

// ============================================================================
// Files and commands
// ============================================================================

/// Copy a file into a container
#[derive(Args, Debug)]
pub struct ContainerPushCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Local file
    pub local: PathBuf,

    /// Destination path inside the container
    pub remote: String,
}

impl ContainerPushCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.command());

        container.push_file(&ctx, &self.local, &self.remote).await?;
        println!("Pushed {} to {}", self.local.display(), self.remote);
        Ok(())
    }
}

/// Execute a command in a container
#[derive(Args, Debug)]
pub struct ContainerExecCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Command and arguments
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl ContainerExecCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.command());

        let lines = container.command(self.command).stream_lines(&ctx);
        tokio::pin!(lines);
        while let Some(line) = lines.next().await {
            println!("{}", line?);
        }
        Ok(())
    }
}

/// Write the container journal to a file
#[derive(Args, Debug)]
pub struct ContainerLogsCmd {
    #[command(flatten)]
    pub target: ContainerTarget,

    /// Output directory (defaults to the configured log directory)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

impl ContainerLogsCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let container = self.target.container(session);
        let ctx = global.context(config.timeouts.command());
        let dir = self.dir.unwrap_or_else(|| config.log_dir.clone());

        let path = container.dump_log(&ctx, &dir).await?;
        println!("{}", path.display());
        Ok(())
    }
}
