//! Package install and uninstall.
//!
//! Both operations are accepted synchronously and then report progress
//! through notifications until a terminal status arrives.

use super::{release, Container};
use crate::bus::call_method;
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use serde::Serialize;
use vmorch_protocol::{
    methods, services, InstallLinuxPackageProgressSignal, InstallLinuxPackageRequest,
    InstallStatus, PackageOperationResponse, PackageRequestStatus, Signal,
    UninstallPackageOwningFileRequest, UninstallPackageProgressSignal, UninstallStatus,
};

impl Container {
    /// Install a package file already present in the container.
    pub async fn install_package(&self, ctx: &Context, file_path: &str) -> Result<()> {
        let key = self.key();
        let request = InstallLinuxPackageRequest {
            vm_name: key.vm_name.clone(),
            container_name: key.container_name.clone(),
            owner_id: key.owner_id.clone(),
            file_path: file_path.to_string(),
        };

        self.package_operation(
            ctx,
            "install package",
            methods::INSTALL_LINUX_PACKAGE,
            &request,
            |signal: InstallLinuxPackageProgressSignal| match signal.status {
                InstallStatus::Succeeded => Some(Ok(())),
                InstallStatus::Failed => Some(Err(Error::failed(
                    "install package",
                    signal.status,
                    signal.failure_details,
                ))),
                InstallStatus::Downloading | InstallStatus::Installing => {
                    tracing::debug!(
                        status = ?signal.status,
                        progress = signal.progress_percent,
                        "install progress"
                    );
                    None
                }
            },
        )
        .await
        .with_context(|| format!("{}: install {}", key, file_path))
    }

    /// Uninstall the package that owns a desktop file.
    pub async fn uninstall_package_owning_file(
        &self,
        ctx: &Context,
        desktop_file_id: &str,
    ) -> Result<()> {
        let key = self.key();
        let request = UninstallPackageOwningFileRequest {
            vm_name: key.vm_name.clone(),
            container_name: key.container_name.clone(),
            owner_id: key.owner_id.clone(),
            desktop_file_id: desktop_file_id.to_string(),
        };

        self.package_operation(
            ctx,
            "uninstall package",
            methods::UNINSTALL_PACKAGE_OWNING_FILE,
            &request,
            |signal: UninstallPackageProgressSignal| match signal.status {
                UninstallStatus::Succeeded => Some(Ok(())),
                UninstallStatus::Failed => Some(Err(Error::failed(
                    "uninstall package",
                    signal.status,
                    signal.failure_details,
                ))),
                UninstallStatus::Uninstalling => {
                    tracing::debug!(progress = signal.progress_percent, "uninstall progress");
                    None
                }
            },
        )
        .await
        .with_context(|| format!("{}: uninstall owner of {}", key, desktop_file_id))
    }

    async fn package_operation<S, Req, F>(
        &self,
        ctx: &Context,
        operation: &str,
        method: &str,
        request: &Req,
        accept: F,
    ) -> Result<()>
    where
        S: Signal,
        Req: Serialize + Sync,
        F: FnMut(S) -> Option<Result<()>>,
    {
        let mut pending = self.register::<S>().await?;

        let result = async {
            let resp: PackageOperationResponse = ctx
                .run(
                    method,
                    call_method(
                        self.session.transport().as_ref(),
                        services::CONTAINERS,
                        method,
                        request,
                    ),
                )
                .await?;

            if resp.status != PackageRequestStatus::Started {
                return Err(Error::rejected(operation, resp.status, resp.failure_reason));
            }
            tracing::info!(container = %pending.key(), operation, "package operation started");

            pending.wait_until(ctx, accept).await
        }
        .await;

        release(pending).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{session, vm};
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;
    use vmorch_protocol::CorrelationKey;

    fn progress(vm: &str, status: InstallStatus, pct: u32, details: &str) -> InstallLinuxPackageProgressSignal {
        InstallLinuxPackageProgressSignal {
            key: CorrelationKey::new(vm, "c1", "owner1"),
            status,
            progress_percent: pct,
            failure_details: details.into(),
        }
    }

    fn ctx() -> Context {
        Context::with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_install_skips_other_keys_and_interim_statuses() {
        let (bus, session) = session();
        bus.handle(
            services::CONTAINERS,
            methods::INSTALL_LINUX_PACKAGE,
            |req: InstallLinuxPackageRequest, bus: &MemoryBus| {
                assert_eq!(req.file_path, "/home/testuser/pkg.deb");
                bus.emit(progress("vm2", InstallStatus::Failed, 0, "unrelated"));
                bus.emit(progress("vm1", InstallStatus::Downloading, 10, ""));
                bus.emit(progress("vm1", InstallStatus::Installing, 60, ""));
                bus.emit(progress("vm1", InstallStatus::Succeeded, 100, ""));
                PackageOperationResponse {
                    status: PackageRequestStatus::Started,
                    failure_reason: String::new(),
                }
            },
        );
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");

        container
            .install_package(&ctx(), "/home/testuser/pkg.deb")
            .await
            .unwrap();
        assert_eq!(bus.active_matches(), 0);
    }

    #[tokio::test]
    async fn test_install_failure_details_verbatim() {
        let (bus, session) = session();
        bus.handle(
            services::CONTAINERS,
            methods::INSTALL_LINUX_PACKAGE,
            |_req: InstallLinuxPackageRequest, bus: &MemoryBus| {
                bus.emit(progress("vm1", InstallStatus::Failed, 30, "dpkg: dependency problems"));
                PackageOperationResponse {
                    status: PackageRequestStatus::Started,
                    failure_reason: String::new(),
                }
            },
        );
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");

        let err = container.install_package(&ctx(), "/tmp/pkg.deb").await.unwrap_err();
        assert!(matches!(err.root(), Error::Failed { .. }));
        assert!(err.to_string().contains("dpkg: dependency problems"));
    }

    #[tokio::test]
    async fn test_install_not_started_is_rejected() {
        let (bus, session) = session();
        bus.handle(
            services::CONTAINERS,
            methods::INSTALL_LINUX_PACKAGE,
            |_req: InstallLinuxPackageRequest, _bus: &MemoryBus| PackageOperationResponse {
                status: PackageRequestStatus::BlockingOperationInProgress,
                failure_reason: "another install is running".into(),
            },
        );
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");

        let err = container.install_package(&ctx(), "/tmp/pkg.deb").await.unwrap_err();
        assert!(err.is_rejected());
        assert!(err.to_string().contains("another install is running"));
        assert_eq!(bus.active_matches(), 0);
    }

    #[tokio::test]
    async fn test_uninstall_succeeds() {
        let (bus, session) = session();
        bus.handle(
            services::CONTAINERS,
            methods::UNINSTALL_PACKAGE_OWNING_FILE,
            |req: UninstallPackageOwningFileRequest, bus: &MemoryBus| {
                let key = CorrelationKey::new(&req.vm_name, &req.container_name, &req.owner_id);
                bus.emit(UninstallPackageProgressSignal {
                    key: key.clone(),
                    status: UninstallStatus::Uninstalling,
                    progress_percent: 50,
                    failure_details: String::new(),
                });
                bus.emit(UninstallPackageProgressSignal {
                    key,
                    status: UninstallStatus::Succeeded,
                    progress_percent: 100,
                    failure_details: String::new(),
                });
                PackageOperationResponse {
                    status: PackageRequestStatus::Started,
                    failure_reason: String::new(),
                }
            },
        );
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");

        container
            .uninstall_package_owning_file(&ctx(), "x11_demo.desktop")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_uninstall_times_out_without_terminal_status() {
        let (bus, session) = session();
        bus.handle(
            services::CONTAINERS,
            methods::UNINSTALL_PACKAGE_OWNING_FILE,
            |_req: UninstallPackageOwningFileRequest, _bus: &MemoryBus| PackageOperationResponse {
                status: PackageRequestStatus::Started,
                failure_reason: String::new(),
            },
        );
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");

        let err = container
            .uninstall_package_owning_file(
                &Context::with_timeout(Duration::from_millis(30)),
                "x11_demo.desktop",
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bus.active_matches(), 0);
    }
}
