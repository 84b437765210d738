//! Container lifecycle state.

/// Container lifecycle as observed by this handle.
///
/// Tracked for diagnostics only. Operations do not check it; calling them
/// out of order is reported by the container service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    /// No successful create observed.
    #[default]
    Unborn,
    /// Creation completed.
    Created,
    /// Start accepted, waiting for the starting notification.
    Starting,
    /// Container reported started.
    Running,
    /// Default user set up.
    UserProvisioned,
    /// Container announced itself ready.
    Ready,
}

impl ContainerState {
    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ContainerState::Unborn => "unborn",
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::UserProvisioned => "user_provisioned",
            ContainerState::Ready => "ready",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
