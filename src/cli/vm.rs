//! VM commands.

use super::parsers::parse_size;
use super::GlobalArgs;
use clap::{Args, Subcommand};
use vmorch::config::OrchConfig;
use vmorch::Vm;

/// VM management commands
#[derive(Subcommand, Debug)]
pub enum VmCmd {
    /// Start a VM and print its allocation
    Start(VmStartCmd),

    /// Stop a VM
    Stop(VmStopCmd),

    /// Print the size of a VM's disk
    DiskSize(VmDiskSizeCmd),
}

impl VmCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        match self {
            VmCmd::Start(cmd) => cmd.run(global, config).await,
            VmCmd::Stop(cmd) => cmd.run(global, config).await,
            VmCmd::DiskSize(cmd) => cmd.run(global, config).await,
        }
    }
}

/// Start a VM
#[derive(Args, Debug)]
pub struct VmStartCmd {
    /// VM name (defaults to the configured VM)
    #[arg(long)]
    pub name: Option<String>,

    /// Enable GPU support
    #[arg(long)]
    pub gpu: bool,

    /// Disk size (e.g. "20G"); the allocator picks one when omitted
    #[arg(long, value_parser = parse_size)]
    pub disk_size: Option<u64>,
}

impl VmStartCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let name = self.name.unwrap_or_else(|| config.vm_name.clone());
        let ctx = global.context(config.timeouts.vm_start());

        let mut vm = Vm::new(session, name, self.gpu, self.disk_size.unwrap_or(0));
        vm.start(&ctx).await?;

        let state = serde_json::to_string_pretty(vm.state())
            .map_err(|e| vmorch::Error::Config(format!("render vm state: {}", e)))?;
        println!("{}", state);
        Ok(())
    }
}

/// Stop a VM
#[derive(Args, Debug)]
pub struct VmStopCmd {
    /// VM name (defaults to the configured VM)
    #[arg(long)]
    pub name: Option<String>,
}

impl VmStopCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let name = self.name.unwrap_or_else(|| config.vm_name.clone());
        let ctx = global.context(config.timeouts.vm_start());

        let mut vm = Vm::new(session, name.clone(), false, 0);
        vm.stop(&ctx).await?;
        println!("Stopped VM '{}'", name);
        Ok(())
    }
}

/// Print a VM's disk size
#[derive(Args, Debug)]
pub struct VmDiskSizeCmd {
    /// VM name (defaults to the configured VM)
    #[arg(long)]
    pub name: Option<String>,
}

impl VmDiskSizeCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let name = self.name.unwrap_or_else(|| config.vm_name.clone());
        let ctx = global.context(config.timeouts.command());

        let size = ctx
            .run("vm disk size", session.allocator().disk_size(&name))
            .await?;
        println!("{}", size);
        Ok(())
    }
}
