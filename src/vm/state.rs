//! VM lifecycle state types.

use serde::Serialize;

/// Resources of a started VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningVm {
    /// Hypervisor context id assigned at start.
    pub context_id: u32,
    /// Path to the VM's disk image.
    pub disk_path: String,
    /// Disk size in bytes as reported by the allocator.
    pub disk_size: u64,
    /// Handle scoping path-sharing requests to this VM.
    pub share_handle: u32,
}

/// VM lifecycle states.
///
/// Allocation data only exists while the VM is running, so reading it from
/// a stopped VM cannot return stale values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VmState {
    /// VM constructed or stopped.
    #[default]
    NotStarted,

    /// VM started by the allocator.
    Running(RunningVm),
}

impl VmState {
    /// Check if the VM is running.
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running(_))
    }

    /// Allocation data, if running.
    pub fn running(&self) -> Option<&RunningVm> {
        match self {
            VmState::Running(vm) => Some(vm),
            VmState::NotStarted => None,
        }
    }

    /// Check if the VM can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::NotStarted)
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmState::NotStarted => "not_started",
            VmState::Running(_) => "running",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Running(vm) => write!(f, "running (cid {})", vm.context_id),
            VmState::NotStarted => write!(f, "{}", self.name()),
        }
    }
}
