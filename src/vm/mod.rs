//! VM handle.
//!
//! A [`Vm`] names one VM in an owner's session and tracks its lifecycle:
//! - [`Vm::start`] asks the allocator to launch it and records the allocation
//! - [`Vm::stop`] asks the allocator to stop it and drops the allocation
//! - [`Vm::command`] builds remote-shell invocations scoped to it
//! - [`Vm::path_sharing`] returns a path-sharing client scoped to it

pub mod state;

use crate::allocator::VmStartRequest;
use crate::command::{RemoteCommand, RemoteTarget};
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use crate::session::Session;
use crate::sharing::PathSharing;
pub use state::{RunningVm, VmState};

/// Name and owner of a VM, without control over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    /// VM name.
    pub name: String,
    /// Owner id of the session the VM belongs to.
    pub owner_id: String,
}

/// Handle to one VM.
#[derive(Debug)]
pub struct Vm {
    session: Session,
    name: String,
    enable_gpu: bool,
    target_disk_size: u64,
    state: VmState,
}

impl Vm {
    /// Create a handle for a VM that has not been started.
    ///
    /// `target_disk_size` of 0 lets the allocator choose.
    pub fn new(
        session: Session,
        name: impl Into<String>,
        enable_gpu: bool,
        target_disk_size: u64,
    ) -> Self {
        Self {
            session,
            name: name.into(),
            enable_gpu,
            target_disk_size,
            state: VmState::NotStarted,
        }
    }

    /// Handle for the configured default VM.
    pub fn default_for(session: Session) -> Self {
        let name = session.config().vm_name.clone();
        Self::new(session, name, false, 0)
    }

    /// VM name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether GPU support was requested.
    pub fn enable_gpu(&self) -> bool {
        self.enable_gpu
    }

    /// Requested disk size in bytes.
    pub fn target_disk_size(&self) -> u64 {
        self.target_disk_size
    }

    /// Session the VM belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &VmState {
        &self.state
    }

    /// Whether the VM has been started.
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Name and owner of this VM.
    pub fn identity(&self) -> VmIdentity {
        VmIdentity {
            name: self.name.clone(),
            owner_id: self.session.owner_id().to_string(),
        }
    }

    /// Start the VM and record its allocation.
    ///
    /// Starting a VM this handle already started is an [`Error::InvalidState`].
    pub async fn start(&mut self, ctx: &Context) -> Result<()> {
        if !self.state.can_start() {
            return Err(Error::InvalidState {
                expected: VmState::NotStarted.name().to_string(),
                actual: self.state.name().to_string(),
            })
            .with_context(|| format!("start vm {}", self.name));
        }

        let allocator = self.session.allocator();
        let request = VmStartRequest {
            name: self.name.clone(),
            enable_gpu: self.enable_gpu,
            disk_size: self.target_disk_size,
            component_path: self.session.component_dir().to_path_buf(),
        };

        tracing::info!(vm = %self.name, gpu = self.enable_gpu, "starting vm");
        let allocated = ctx
            .run("vm start", allocator.start_vm(request))
            .await
            .with_context(|| format!("start vm {}", self.name))?;

        let disk_size = ctx
            .run("vm disk size", allocator.disk_size(&self.name))
            .await
            .with_context(|| format!("start vm {}: query disk size", self.name))?;

        self.state = VmState::Running(RunningVm {
            context_id: allocated.context_id,
            disk_path: allocated.disk_path,
            disk_size,
            share_handle: allocated.share_handle,
        });
        tracing::info!(vm = %self.name, state = %self.state, disk_size, "vm started");
        Ok(())
    }

    /// Stop the VM and drop its allocation.
    pub async fn stop(&mut self, ctx: &Context) -> Result<()> {
        tracing::info!(vm = %self.name, "stopping vm");
        ctx.run("vm stop", self.session.allocator().stop_vm(&self.name))
            .await
            .with_context(|| format!("stop vm {}", self.name))?;

        self.state = VmState::NotStarted;
        Ok(())
    }

    fn running(&self) -> Result<&RunningVm> {
        self.state
            .running()
            .ok_or_else(|| Error::Unallocated(self.name.clone()))
    }

    /// Disk size in bytes.
    pub fn disk_size(&self) -> Result<u64> {
        self.running().map(|vm| vm.disk_size)
    }

    /// Hypervisor context id.
    pub fn context_id(&self) -> Result<u32> {
        self.running().map(|vm| vm.context_id)
    }

    /// Path to the VM's disk image.
    pub fn disk_path(&self) -> Result<&str> {
        self.running().map(|vm| vm.disk_path.as_str())
    }

    /// Build a command that runs in the VM itself.
    ///
    /// Does not start the VM.
    pub fn command<I, S>(&self, args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteCommand::new(
            self.session.config().remote_shell.clone(),
            RemoteTarget::vm(&self.name, self.session.owner_id()),
            args,
        )
    }

    /// Path-sharing client scoped to this VM.
    pub fn path_sharing(&self) -> Result<PathSharing> {
        let vm = self.running()?;
        Ok(PathSharing::new(
            self.session.transport().clone(),
            self.session.owner_id(),
            vm.share_handle,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::OrchConfig;
    use std::sync::Arc;
    use vmorch_protocol::{
        methods, services, ListVmDisksRequest, ListVmDisksResponse, StartVmRequest,
        StartVmResponse, StopVmRequest, StopVmResponse, VmDiskInfo, VmInfo,
    };

    fn session() -> (Arc<MemoryBus>, Session) {
        let (bus, raw) = MemoryBus::new();
        bus.handle(
            services::ALLOCATOR,
            methods::START_VM,
            |req: StartVmRequest, _bus: &MemoryBus| StartVmResponse {
                success: true,
                failure_reason: String::new(),
                vm_info: Some(VmInfo {
                    cid: 33,
                    share_handle: 7,
                    disk_path: format!("/home/{}/{}.img", req.owner_id, req.name),
                }),
            },
        );
        bus.handle(
            services::ALLOCATOR,
            methods::LIST_VM_DISKS,
            |_req: ListVmDisksRequest, _bus: &MemoryBus| ListVmDisksResponse {
                success: true,
                failure_reason: String::new(),
                images: vec![VmDiskInfo {
                    name: "termina".into(),
                    path: "/home/owner1/termina.img".into(),
                    size: 10 << 30,
                }],
            },
        );
        bus.handle(
            services::ALLOCATOR,
            methods::STOP_VM,
            |_req: StopVmRequest, _bus: &MemoryBus| StopVmResponse {
                success: true,
                failure_reason: String::new(),
            },
        );
        let session = Session::new(OrchConfig::default(), "owner1", bus.clone(), raw);
        (bus, session)
    }

    #[tokio::test]
    async fn test_disk_size_unallocated_before_start() {
        let (_bus, session) = session();
        let vm = Vm::new(session, "termina", false, 0);
        assert!(matches!(vm.disk_size(), Err(Error::Unallocated(ref name)) if name == "termina"));
        assert!(vm.context_id().is_err());
        assert!(vm.path_sharing().is_err());
    }

    #[tokio::test]
    async fn test_start_records_allocation() {
        let (bus, session) = session();
        let mut vm = Vm::new(session, "termina", false, 0);
        let ctx = Context::background();

        vm.start(&ctx).await.unwrap();
        assert!(vm.is_running());
        assert_eq!(vm.context_id().unwrap(), 33);
        assert_eq!(vm.disk_size().unwrap(), 10 << 30);
        assert_eq!(vm.disk_path().unwrap(), "/home/owner1/termina.img");
        assert_eq!(vm.path_sharing().unwrap().share_handle(), 7);
        assert_eq!(bus.calls(), vec![methods::START_VM, methods::LIST_VM_DISKS]);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let (bus, session) = session();
        let mut vm = Vm::new(session, "termina", false, 0);
        let ctx = Context::background();

        vm.start(&ctx).await.unwrap();
        let err = vm.start(&ctx).await.unwrap_err();
        assert!(matches!(err.root(), Error::InvalidState { .. }));
        assert_eq!(bus.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_drops_allocation_and_allows_restart() {
        let (_bus, session) = session();
        let mut vm = Vm::new(session, "termina", false, 0);
        let ctx = Context::background();

        vm.start(&ctx).await.unwrap();
        vm.stop(&ctx).await.unwrap();
        assert_eq!(vm.state(), &VmState::NotStarted);
        assert!(matches!(vm.disk_size(), Err(Error::Unallocated(_))));

        vm.start(&ctx).await.unwrap();
        assert!(vm.is_running());
    }

    #[tokio::test]
    async fn test_start_rejection_keeps_reason() {
        let (bus, session) = session();
        bus.handle(
            services::ALLOCATOR,
            methods::START_VM,
            |_req: StartVmRequest, _bus: &MemoryBus| StartVmResponse {
                success: false,
                failure_reason: "component not mounted".into(),
                vm_info: None,
            },
        );
        let mut vm = Vm::new(session, "termina", false, 0);

        let err = vm.start(&Context::background()).await.unwrap_err();
        assert!(err.to_string().contains("start vm termina"));
        assert!(err.to_string().contains("component not mounted"));
        assert!(!vm.is_running());
    }

    #[tokio::test]
    async fn test_command_targets_vm() {
        let (_bus, session) = session();
        let vm = Vm::default_for(session);
        let cmd = vm.command(["uname", "-a"]);
        assert_eq!(
            cmd.argv(),
            vec!["--vm_name=termina", "--owner_id=owner1", "--", "uname", "-a"]
        );
    }
}
