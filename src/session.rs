//! Orchestration session.
//!
//! A [`Session`] bundles everything VM and container handles share: the
//! owner id used in every correlation key, the bus transport, the single
//! notification dispatcher, the allocator, configuration and the mounted
//! VM component directory. Cloning a session is cheap and shares all of it.

use crate::allocator::{Allocator, ServiceAllocator};
use crate::bus::{RawSignal, SocketTransport, Transport};
use crate::config::OrchConfig;
use crate::error::{Error, Result, ResultExt};
use crate::signal::Dispatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state for one owner's orchestration calls.
#[derive(Clone)]
pub struct Session {
    owner_id: String,
    config: Arc<OrchConfig>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    allocator: Arc<dyn Allocator>,
    component_dir: PathBuf,
}

impl Session {
    /// Build a session over an existing transport.
    ///
    /// Starts the notification dispatcher, so it must be called from within
    /// a tokio runtime. The allocator defaults to the allocator service on
    /// the same bus.
    pub fn new(
        config: OrchConfig,
        owner_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        raw_signals: mpsc::UnboundedReceiver<RawSignal>,
    ) -> Self {
        let owner_id = owner_id.into();
        let dispatcher = Dispatcher::spawn(Arc::clone(&transport), raw_signals);
        let allocator: Arc<dyn Allocator> =
            Arc::new(ServiceAllocator::new(Arc::clone(&transport), owner_id.clone()));
        let component_dir = config.component_dir.clone();

        Self {
            owner_id,
            config: Arc::new(config),
            transport,
            dispatcher,
            allocator,
            component_dir,
        }
    }

    /// Connect to the bus socket named in `config`.
    pub async fn connect(config: OrchConfig, owner_id: impl Into<String>) -> Result<Self> {
        let owner_id = owner_id.into();
        if owner_id.is_empty() {
            return Err(Error::Config("owner id must not be empty".into()));
        }
        config.validate()?;

        let (transport, raw_signals) = SocketTransport::connect(&config.bus_socket)
            .await
            .context("open session")?;

        tracing::info!(owner = %owner_id, socket = %config.bus_socket.display(), "session connected");
        Ok(Self::new(config, owner_id, transport, raw_signals))
    }

    /// Replace the allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Use a different mounted VM component directory.
    pub fn with_component_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.component_dir = dir.into();
        self
    }

    /// Owner id used in every correlation key.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Session configuration.
    pub fn config(&self) -> &OrchConfig {
        &self.config
    }

    /// Bus transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Notification dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// VM allocator.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Mounted VM component directory passed to the allocator on start.
    pub fn component_dir(&self) -> &Path {
        &self.component_dir
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner_id", &self.owner_id)
            .field("component_dir", &self.component_dir)
            .finish_non_exhaustive()
    }
}
