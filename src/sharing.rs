//! Path-sharing client.
//!
//! Exposes host directories inside a VM through the path-sharing service.
//! Every request is scoped by the share handle the allocator returned when
//! the VM started. A refusal is a value, not an error.

use crate::bus::{call_method, Transport};
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use std::sync::Arc;
use vmorch_protocol::{
    methods, services, SharePathRequest, SharePathResponse, StorageLocation, UnsharePathRequest,
    UnsharePathResponse,
};

/// Outcome of a share request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedPathGrant {
    /// The path is visible inside the VM at `path`.
    Granted {
        /// Path inside the VM.
        path: String,
    },
    /// The service refused.
    Refused {
        /// Reason given by the service.
        reason: String,
    },
}

impl SharedPathGrant {
    /// Whether the share succeeded.
    pub fn is_granted(&self) -> bool {
        matches!(self, SharedPathGrant::Granted { .. })
    }

    /// The in-VM path, or a rejection carrying the service's reason.
    pub fn into_result(self) -> Result<String> {
        match self {
            SharedPathGrant::Granted { path } => Ok(path),
            SharedPathGrant::Refused { reason } => {
                Err(Error::rejected("share path", "FAILURE", reason))
            }
        }
    }
}

impl From<SharePathResponse> for SharedPathGrant {
    fn from(resp: SharePathResponse) -> Self {
        if resp.success {
            SharedPathGrant::Granted { path: resp.path }
        } else {
            SharedPathGrant::Refused {
                reason: resp.failure_reason,
            }
        }
    }
}

/// Client for the path-sharing service, scoped to one VM.
#[derive(Clone)]
pub struct PathSharing {
    transport: Arc<dyn Transport>,
    owner_id: String,
    share_handle: u32,
}

impl PathSharing {
    /// Create a client for the VM identified by `share_handle`.
    pub fn new(transport: Arc<dyn Transport>, owner_id: impl Into<String>, share_handle: u32) -> Self {
        Self {
            transport,
            owner_id: owner_id.into(),
            share_handle,
        }
    }

    /// Share handle requests are scoped to.
    pub fn share_handle(&self) -> u32 {
        self.share_handle
    }

    /// Share `path` (relative to `location`) into the VM.
    pub async fn share_path(
        &self,
        ctx: &Context,
        location: StorageLocation,
        path: &str,
        writable: bool,
    ) -> Result<SharedPathGrant> {
        let request = SharePathRequest {
            handle: self.share_handle,
            owner_id: self.owner_id.clone(),
            location,
            path: path.to_string(),
            writable,
        };

        let resp: SharePathResponse = ctx
            .run(
                methods::SHARE_PATH,
                call_method(
                    self.transport.as_ref(),
                    services::PATH_SHARING,
                    methods::SHARE_PATH,
                    &request,
                ),
            )
            .await
            .with_context(|| format!("share {}", path))?;

        let grant = SharedPathGrant::from(resp);
        match &grant {
            SharedPathGrant::Granted { path: shared } => {
                tracing::info!(path, shared = %shared, writable, "shared path");
            }
            SharedPathGrant::Refused { reason } => {
                tracing::debug!(path, reason = %reason, "share refused");
            }
        }
        Ok(grant)
    }

    /// Share `path` and return the in-VM path, treating refusal as an error.
    pub async fn share_path_resolved(
        &self,
        ctx: &Context,
        location: StorageLocation,
        path: &str,
        writable: bool,
    ) -> Result<String> {
        self.share_path(ctx, location, path, writable)
            .await?
            .into_result()
            .with_context(|| format!("share {}", path))
    }

    /// Stop sharing `path`.
    pub async fn unshare_path(
        &self,
        ctx: &Context,
        location: StorageLocation,
        path: &str,
    ) -> Result<()> {
        let request = UnsharePathRequest {
            handle: self.share_handle,
            owner_id: self.owner_id.clone(),
            location,
            path: path.to_string(),
        };

        let resp: UnsharePathResponse = ctx
            .run(
                methods::UNSHARE_PATH,
                call_method(
                    self.transport.as_ref(),
                    services::PATH_SHARING,
                    methods::UNSHARE_PATH,
                    &request,
                ),
            )
            .await
            .with_context(|| format!("unshare {}", path))?;

        if !resp.success {
            return Err(Error::rejected("unshare path", "FAILURE", resp.failure_reason))
                .with_context(|| format!("unshare {}", path));
        }
        tracing::info!(path, "unshared path");
        Ok(())
    }
}
