//! Path-sharing commands.
//!
//! The share handle is printed by `vmorch vm start` as `share_handle`.

use super::parsers::LocationArg;
use super::GlobalArgs;
use clap::Args;
use vmorch::config::OrchConfig;
use vmorch::sharing::PathSharing;

/// Share a host path into a VM
#[derive(Args, Debug)]
pub struct ShareCmd {
    /// Share handle of the running VM
    #[arg(long)]
    pub handle: u32,

    /// Storage location the path is relative to
    #[arg(long, value_enum, default_value_t = LocationArg::MyFiles)]
    pub location: LocationArg,

    /// Allow writes from inside the VM
    #[arg(long)]
    pub writable: bool,

    /// Path relative to the storage location
    pub path: String,
}

impl ShareCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let sharing = PathSharing::new(session.transport().clone(), session.owner_id(), self.handle);
        let ctx = global.context(config.timeouts.command());

        let shared = sharing
            .share_path_resolved(&ctx, self.location.into(), &self.path, self.writable)
            .await?;
        println!("{}", shared);
        Ok(())
    }
}

/// Stop sharing a host path
#[derive(Args, Debug)]
pub struct UnshareCmd {
    /// Share handle of the running VM
    #[arg(long)]
    pub handle: u32,

    /// Storage location the path is relative to
    #[arg(long, value_enum, default_value_t = LocationArg::MyFiles)]
    pub location: LocationArg,

    /// Path relative to the storage location
    pub path: String,
}

impl UnshareCmd {
    pub async fn run(self, global: &GlobalArgs, config: &OrchConfig) -> vmorch::Result<()> {
        let session = global.connect(config).await?;
        let sharing = PathSharing::new(session.transport().clone(), session.owner_id(), self.handle);
        let ctx = global.context(config.timeouts.command());

        sharing
            .unshare_path(&ctx, self.location.into(), &self.path)
            .await?;
        println!("Unshared {}", self.path);
        Ok(())
    }
}
