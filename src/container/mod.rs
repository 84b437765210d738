//! Container handle.
//!
//! A [`Container`] names one container inside a VM. Its asynchronous
//! operations all follow the same shape: register a [`Pending`] wait for
//! the completion notification, issue the request, check the synchronous
//! status, then wait for a notification carrying this container's
//! correlation key. The wait is released on every exit path.

mod package;
pub mod state;
mod transfer;
pub mod watcher;

use crate::bus::call_method;
use crate::command::{RemoteCommand, RemoteTarget};
use crate::config::{ImageChannel, OrchConfig};
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use crate::session::Session;
use crate::signal::Pending;
use crate::vm::{Vm, VmIdentity};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use vmorch_protocol::{
    methods, services, ContainerStartedSignal, CorrelationKey, CreateLxdContainerRequest,
    CreateLxdContainerResponse, CreateStatus, CreatedStatus, LxdContainerCreatedSignal,
    LxdContainerStartingSignal, SetUpLxdContainerUserRequest, SetUpLxdContainerUserResponse,
    SetUpUserStatus, Signal, StartLxdContainerRequest, StartLxdContainerResponse, StartStatus,
    StartingStatus,
};

pub use state::ContainerState;
pub use watcher::CreationWatcher;

/// Image a container is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Image channel selecting the image server.
    pub channel: ImageChannel,
    /// Milestone substituted into the server URL.
    pub milestone: u32,
    /// Image alias on the server.
    pub alias: String,
}

impl ImageSource {
    /// Image source from configuration defaults.
    pub fn from_config(config: &OrchConfig) -> Self {
        Self {
            channel: config.image_channel,
            milestone: config.milestone,
            alias: config.image_alias.clone(),
        }
    }

    /// Image server URL for this source.
    pub fn server_url(&self, config: &OrchConfig) -> String {
        config.image_servers.url(self.channel, self.milestone)
    }
}

/// Handle to one container inside a VM.
pub struct Container {
    session: Session,
    vm: VmIdentity,
    name: String,
    user: String,
    state: Mutex<ContainerState>,
}

impl Container {
    /// Create a handle for container `name` in `vm`.
    ///
    /// The handle does not keep the VM alive.
    pub fn new(vm: &Vm, name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            session: vm.session().clone(),
            vm: vm.identity(),
            name: name.into(),
            user: user.into(),
            state: Mutex::new(ContainerState::Unborn),
        }
    }

    /// Handle for the configured default container and user.
    pub fn default_for(vm: &Vm) -> Self {
        let config = vm.session().config();
        let name = config.container_name.clone();
        let user = config.container_user.clone();
        Self::new(vm, name, user)
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Identity of the VM the container lives in.
    pub fn vm(&self) -> &VmIdentity {
        &self.vm
    }

    /// Session the container belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Last lifecycle state observed by this handle.
    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ContainerState) {
        let mut current = self.state.lock();
        tracing::debug!(container = %self.name, from = current.name(), to = state.name(), "container state");
        *current = state;
    }

    /// Correlation key matching notifications for this container.
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.vm.name, &self.name, &self.vm.owner_id)
    }

    async fn register<S: Signal>(&self) -> Result<Pending<S>> {
        Pending::register(self.session.dispatcher(), self.key()).await
    }

    /// Create the container and wait until creation finishes.
    ///
    /// Callers that want download progress should open a
    /// [`CreationWatcher`] before calling this.
    pub async fn create(&self, ctx: &Context, image: &ImageSource) -> Result<()> {
        let key = self.key();
        let mut pending = self
            .register::<LxdContainerCreatedSignal>()
            .await
            .with_context(|| format!("{}: create", key))?;

        let result = async {
            let request = CreateLxdContainerRequest {
                vm_name: key.vm_name.clone(),
                container_name: key.container_name.clone(),
                owner_id: key.owner_id.clone(),
                image_server: image.server_url(self.session.config()),
                image_alias: image.alias.clone(),
            };
            tracing::info!(
                container = %key,
                server = %request.image_server,
                alias = %request.image_alias,
                "creating container"
            );

            let resp: CreateLxdContainerResponse = ctx
                .run(
                    methods::CREATE_LXD_CONTAINER,
                    call_method(
                        self.session.transport().as_ref(),
                        services::CONTAINERS,
                        methods::CREATE_LXD_CONTAINER,
                        &request,
                    ),
                )
                .await?;

            match resp.status {
                CreateStatus::Creating => {}
                CreateStatus::Exists => {
                    return Err(Error::rejected(
                        "create container",
                        resp.status,
                        "container already exists",
                    ));
                }
                other => {
                    return Err(Error::rejected("create container", other, resp.failure_reason));
                }
            }

            let signal = pending.next(ctx).await?;
            created_outcome(signal)
        }
        .await;

        release(pending).await;
        result.with_context(|| format!("{}: create", key))?;

        self.set_state(ContainerState::Created);
        tracing::info!(container = %key, "container created");
        Ok(())
    }

    /// Start the container and wait for the starting notification.
    pub async fn start(&self, ctx: &Context) -> Result<()> {
        let key = self.key();
        let mut pending = self
            .register::<LxdContainerStartingSignal>()
            .await
            .with_context(|| format!("{}: start", key))?;

        let result = async {
            let request = StartLxdContainerRequest {
                vm_name: key.vm_name.clone(),
                container_name: key.container_name.clone(),
                owner_id: key.owner_id.clone(),
                async_start: true,
            };
            let resp: StartLxdContainerResponse = ctx
                .run(
                    methods::START_LXD_CONTAINER,
                    call_method(
                        self.session.transport().as_ref(),
                        services::CONTAINERS,
                        methods::START_LXD_CONTAINER,
                        &request,
                    ),
                )
                .await?;

            match resp.status {
                StartStatus::Starting | StartStatus::Remapping => {}
                StartStatus::Running => {
                    return Err(Error::rejected(
                        "start container",
                        resp.status,
                        "container already running",
                    ));
                }
                other => {
                    return Err(Error::rejected("start container", other, resp.failure_reason));
                }
            }
            self.set_state(ContainerState::Starting);

            let signal = pending.next(ctx).await?;
            match signal.status {
                StartingStatus::Started => Ok(()),
                other => Err(Error::failed("start container", other, signal.failure_reason)),
            }
        }
        .await;

        release(pending).await;
        result.with_context(|| format!("{}: start", key))?;

        self.set_state(ContainerState::Running);
        tracing::info!(container = %key, "container running");
        Ok(())
    }

    /// Set up the default user. An existing user counts as success.
    pub async fn set_up_user(&self, ctx: &Context) -> Result<()> {
        let key = self.key();
        let request = SetUpLxdContainerUserRequest {
            vm_name: key.vm_name.clone(),
            container_name: key.container_name.clone(),
            owner_id: key.owner_id.clone(),
            container_username: self.user.clone(),
        };

        let resp: SetUpLxdContainerUserResponse = ctx
            .run(
                methods::SET_UP_LXD_CONTAINER_USER,
                call_method(
                    self.session.transport().as_ref(),
                    services::CONTAINERS,
                    methods::SET_UP_LXD_CONTAINER_USER,
                    &request,
                ),
            )
            .await
            .with_context(|| format!("{}: set up user {}", key, self.user))?;

        match resp.status {
            SetUpUserStatus::Success | SetUpUserStatus::Exists => {
                self.set_state(ContainerState::UserProvisioned);
                Ok(())
            }
            other => Err(Error::rejected("set up user", other, resp.failure_reason))
                .with_context(|| format!("{}: set up user {}", key, self.user)),
        }
    }

    /// Start the container, set up its user, and wait until it reports ready.
    ///
    /// If user setup fails, the container journal is written to `log_dir`
    /// before the error is returned.
    pub async fn start_and_wait(&self, ctx: &Context, log_dir: &Path) -> Result<()> {
        let key = self.key();
        let mut started = self
            .register::<ContainerStartedSignal>()
            .await
            .with_context(|| format!("{}: start and wait", key))?;

        let result = async {
            self.start(ctx).await?;

            if let Err(e) = self.set_up_user(ctx).await {
                if let Err(dump_err) = self.dump_log(ctx, log_dir).await {
                    tracing::warn!(container = %key, error = %dump_err, "failed to dump container log");
                }
                return Err(e);
            }

            let signal = started.next(ctx).await?;
            tracing::debug!(
                container = %key,
                user = %signal.container_username,
                ipv4 = ?signal.ipv4_address,
                "container started"
            );
            Ok(())
        }
        .await;

        release(started).await;
        result.with_context(|| format!("{}: start and wait", key))?;

        self.set_state(ContainerState::Ready);
        tracing::info!(container = %key, "container ready");
        Ok(())
    }

    /// Build a command that runs in this container.
    pub fn command<I, S>(&self, args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteCommand::new(
            self.session.config().remote_shell.clone(),
            RemoteTarget::container(&self.vm.name, &self.name, &self.vm.owner_id),
            args,
        )
    }

    /// Path of the log artifact [`Container::dump_log`] writes in `dir`.
    pub fn log_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("container_log_{}_{}.txt", self.vm.name, self.name))
    }

    /// Write the container's system journal to a file in `dir`.
    pub async fn dump_log(&self, ctx: &Context, dir: &Path) -> Result<PathBuf> {
        let journal = self
            .command(["journalctl", "--no-pager"])
            .run(ctx)
            .await
            .with_context(|| format!("{}: read journal", self.key()))?;

        let path = self.log_path(dir);
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, journal).await?;

        tracing::info!(container = %self.key(), path = %path.display(), "wrote container log");
        Ok(path)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("vm", &self.vm)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("state", &self.state())
            .finish()
    }
}

/// Map a creation notification to the outcome of the create.
pub(crate) fn created_outcome(signal: LxdContainerCreatedSignal) -> Result<()> {
    match signal.status {
        CreatedStatus::Created => Ok(()),
        other => Err(Error::failed("create container", other, signal.failure_reason)),
    }
}

async fn release<S: Signal>(pending: Pending<S>) {
    let key = pending.key().clone();
    if let Err(e) = pending.close().await {
        tracing::warn!(container = %key, signal = S::NAME, error = %e, "failed to release subscription");
    }
}
