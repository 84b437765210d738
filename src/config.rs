//! Global vmorch configuration.
//!
//! This module handles persistent configuration for the orchestration
//! client: where the bus lives, which VM/container/user are the defaults,
//! which image servers to pull container images from, and how long each
//! asynchronous phase may take.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "vmorch";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Default remote-shell program.
pub const DEFAULT_REMOTE_SHELL: &str = "/usr/bin/vsh";

/// Default VM name.
pub const DEFAULT_VM_NAME: &str = "termina";

/// Default container name.
pub const DEFAULT_CONTAINER_NAME: &str = "penguin";

/// Default container user.
pub const DEFAULT_CONTAINER_USER: &str = "testuser";

/// Default number of raw bytes per pushed file chunk.
///
/// Base64 grows this by a third; the encoded chunk stays far below the
/// kernel's 128 KiB per-argument limit.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Image channel a container image is pulled from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageChannel {
    /// Released images.
    #[default]
    Live,
    /// Pre-release images.
    Staging,
}

impl std::fmt::Display for ImageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageChannel::Live => write!(f, "live"),
            ImageChannel::Staging => write!(f, "staging"),
        }
    }
}

impl std::str::FromStr for ImageChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "live" => Ok(ImageChannel::Live),
            "staging" => Ok(ImageChannel::Staging),
            other => Err(Error::Config(format!("unknown image channel: {}", other))),
        }
    }
}

/// Image server URL templates. `{milestone}` is replaced at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageServers {
    /// Template for the live channel.
    pub live: String,
    /// Template for the staging channel.
    pub staging: String,
}

impl Default for ImageServers {
    fn default() -> Self {
        Self {
            live: "https://storage.googleapis.com/cros-containers/{milestone}".to_string(),
            staging: "https://storage.googleapis.com/cros-containers-staging/{milestone}"
                .to_string(),
        }
    }
}

impl ImageServers {
    /// Resolve the server URL for a channel and milestone.
    pub fn url(&self, channel: ImageChannel, milestone: u32) -> String {
        let template = match channel {
            ImageChannel::Live => &self.live,
            ImageChannel::Staging => &self.staging,
        };
        template.replace("{milestone}", &milestone.to_string())
    }
}

/// Per-phase timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// VM start (allocator call).
    pub vm_start_secs: u64,
    /// Container creation, including image download.
    pub create_secs: u64,
    /// Container start and user setup.
    pub start_secs: u64,
    /// Package install/uninstall.
    pub package_secs: u64,
    /// Remote commands.
    pub command_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            vm_start_secs: 60,
            create_secs: 600,
            start_secs: 120,
            package_secs: 300,
            command_secs: 60,
        }
    }
}

impl TimeoutConfig {
    /// VM start timeout.
    pub fn vm_start(&self) -> Duration {
        Duration::from_secs(self.vm_start_secs)
    }

    /// Container creation timeout.
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }

    /// Container start timeout.
    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    /// Package operation timeout.
    pub fn package(&self) -> Duration {
        Duration::from_secs(self.package_secs)
    }

    /// Remote command timeout.
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

/// Global vmorch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchConfig {
    /// Configuration format version.
    pub version: u8,

    /// Unix socket of the message bus.
    pub bus_socket: PathBuf,

    /// Directory holding the VM kernel and rootfs images.
    pub component_dir: PathBuf,

    /// Default VM name.
    pub vm_name: String,

    /// Default container name.
    pub container_name: String,

    /// Default container user.
    pub container_user: String,

    /// Default image channel.
    pub image_channel: ImageChannel,

    /// Milestone substituted into image server URLs.
    pub milestone: u32,

    /// Default image alias.
    pub image_alias: String,

    /// Remote-shell program used by the command bridge.
    pub remote_shell: PathBuf,

    /// Raw bytes per pushed file chunk.
    pub chunk_size: usize,

    /// Directory for diagnostic logs.
    pub log_dir: PathBuf,

    /// Image server templates.
    pub image_servers: ImageServers,

    /// Per-phase timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for OrchConfig {
    fn default() -> Self {
        let runtime_dir = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"));

        Self {
            version: 1,
            bus_socket: runtime_dir.join(APP_NAME).join("bus.sock"),
            component_dir: PathBuf::from("/run/imageloader/termina"),
            vm_name: DEFAULT_VM_NAME.to_string(),
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            container_user: DEFAULT_CONTAINER_USER.to_string(),
            image_channel: ImageChannel::Live,
            milestone: 120,
            image_alias: "debian/bookworm".to_string(),
            remote_shell: PathBuf::from(DEFAULT_REMOTE_SHELL),
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_dir: std::env::temp_dir().join(APP_NAME),
            image_servers: ImageServers::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl OrchConfig {
    /// Default config file path.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not determine config directory".into()))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file missing, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Check values that would break the protocol.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.vm_name.is_empty() || self.container_name.is_empty() {
            return Err(Error::Config("vm_name and container_name must be set".into()));
        }
        Ok(())
    }

    /// Image server URL for a channel at the configured milestone.
    pub fn image_server(&self, channel: ImageChannel) -> String {
        self.image_servers.url(channel, self.milestone)
    }
}
