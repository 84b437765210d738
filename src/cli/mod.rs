//! CLI command implementations.

pub mod container;
pub mod parsers;
pub mod share;
pub mod vm;

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use vmorch::config::OrchConfig;
use vmorch::{Context, Error, Session};

/// Environment variable consulted when `--owner-id` is not given.
pub const OWNER_ID_ENV: &str = "VMORCH_OWNER_ID";

/// Options shared by every command.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Owner id of the session (defaults to $VMORCH_OWNER_ID)
    #[arg(long, global = true)]
    pub owner_id: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Bus socket, overriding the config file
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Overall deadline for the command (e.g. "90s", "5m")
    #[arg(long, global = true, value_parser = parsers::parse_duration)]
    pub timeout: Option<Duration>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,
}

impl GlobalArgs {
    /// Load configuration, applying command-line overrides.
    pub fn load_config(&self) -> vmorch::Result<OrchConfig> {
        let mut config = match &self.config {
            Some(path) => OrchConfig::load_from(path)?,
            None => OrchConfig::load()?,
        };
        if let Some(socket) = &self.socket {
            config.bus_socket = socket.clone();
        }
        Ok(config)
    }

    /// Owner id from the flag or the environment.
    pub fn owner_id(&self) -> vmorch::Result<String> {
        self.owner_id
            .clone()
            .or_else(|| std::env::var(OWNER_ID_ENV).ok())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Error::Config(format!("owner id required: pass --owner-id or set {}", OWNER_ID_ENV))
            })
    }

    /// Connect a session to the configured bus.
    pub async fn connect(&self, config: &OrchConfig) -> vmorch::Result<Session> {
        Session::connect(config.clone(), self.owner_id()?).await
    }

    /// Context bounded by `--timeout`, or `default` when not given.
    ///
    /// Ctrl-C cancels the context.
    pub fn context(&self, default: Duration) -> Context {
        let ctx = Context::with_timeout(self.timeout.unwrap_or(default));
        let token = ctx.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupted, cancelling");
                token.cancel();
            }
        });
        ctx
    }
}
