//! VM allocator contract.
//!
//! The allocator service owns VM images and hypervisor processes. A VM
//! handle only asks it to start or stop a VM by name and to report the disk
//! it allocated.

use crate::bus::{call_method, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use vmorch_protocol::{
    methods, services, ListVmDisksRequest, ListVmDisksResponse, StartVmRequest, StartVmResponse,
    StopVmRequest, StopVmResponse,
};

/// Parameters for starting a VM.
#[derive(Debug, Clone)]
pub struct VmStartRequest {
    /// VM name.
    pub name: String,
    /// Whether to enable GPU support.
    pub enable_gpu: bool,
    /// Requested disk size in bytes (0 = allocator default).
    pub disk_size: u64,
    /// Mounted VM component image directory.
    pub component_path: PathBuf,
}

/// Resources handed out for a started VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedVm {
    /// Hypervisor context id.
    pub context_id: u32,
    /// Path to the VM's disk image.
    pub disk_path: String,
    /// Handle scoping path-sharing requests.
    pub share_handle: u32,
}

/// Session-scoped allocator.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Owner id the allocator acts for.
    fn owner_id(&self) -> &str;

    /// Start a VM.
    async fn start_vm(&self, request: VmStartRequest) -> Result<AllocatedVm>;

    /// Stop a VM.
    async fn stop_vm(&self, name: &str) -> Result<()>;

    /// Size in bytes of the disk allocated for a VM.
    async fn disk_size(&self, name: &str) -> Result<u64>;
}

/// [`Allocator`] backed by the allocator service on the bus.
pub struct ServiceAllocator {
    transport: Arc<dyn Transport>,
    owner_id: String,
}

impl ServiceAllocator {
    /// Create an allocator client for `owner_id`.
    pub fn new(transport: Arc<dyn Transport>, owner_id: impl Into<String>) -> Self {
        Self {
            transport,
            owner_id: owner_id.into(),
        }
    }
}

#[async_trait]
impl Allocator for ServiceAllocator {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    async fn start_vm(&self, request: VmStartRequest) -> Result<AllocatedVm> {
        let resp: StartVmResponse = call_method(
            self.transport.as_ref(),
            services::ALLOCATOR,
            methods::START_VM,
            &StartVmRequest {
                owner_id: self.owner_id.clone(),
                name: request.name.clone(),
                enable_gpu: request.enable_gpu,
                disk_size: request.disk_size,
                component_path: request.component_path.to_string_lossy().into_owned(),
            },
        )
        .await?;

        if !resp.success {
            return Err(Error::rejected("start vm", "FAILURE", resp.failure_reason));
        }
        let info = resp.vm_info.ok_or_else(|| {
            Error::transport(
                format!("{} reply", methods::START_VM),
                "success without vm info",
            )
        })?;

        tracing::debug!(vm = %request.name, cid = info.cid, "allocator started vm");
        Ok(AllocatedVm {
            context_id: info.cid,
            disk_path: info.disk_path,
            share_handle: info.share_handle,
        })
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        let resp: StopVmResponse = call_method(
            self.transport.as_ref(),
            services::ALLOCATOR,
            methods::STOP_VM,
            &StopVmRequest {
                owner_id: self.owner_id.clone(),
                name: name.to_string(),
            },
        )
        .await?;

        if !resp.success {
            return Err(Error::rejected("stop vm", "FAILURE", resp.failure_reason));
        }
        Ok(())
    }

    async fn disk_size(&self, name: &str) -> Result<u64> {
        let resp: ListVmDisksResponse = call_method(
            self.transport.as_ref(),
            services::ALLOCATOR,
            methods::LIST_VM_DISKS,
            &ListVmDisksRequest {
                owner_id: self.owner_id.clone(),
            },
        )
        .await?;

        if !resp.success {
            return Err(Error::rejected("list vm disks", "FAILURE", resp.failure_reason));
        }
        resp.images
            .into_iter()
            .find(|image| image.name == name)
            .map(|image| image.size)
            .ok_or_else(|| Error::Unallocated(name.to_string()))
    }
}
