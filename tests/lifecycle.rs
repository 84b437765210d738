//! End-to-end lifecycle tests over the in-process bus.

use std::sync::Arc;
use std::time::Duration;
use vmorch::bus::MemoryBus;
use vmorch::config::OrchConfig;
use vmorch::{Container, ContainerState, Context, CreationWatcher, Error, ImageSource, Session, Vm};
use vmorch_protocol::*;

const OWNER: &str = "owner1";

fn key(vm: &str, container: &str) -> CorrelationKey {
    CorrelationKey::new(vm, container, OWNER)
}

fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(5))
}

/// Session whose remote shell does not exist, so log dumps fail.
fn session(dir: &std::path::Path) -> (Arc<MemoryBus>, Session) {
    let (bus, raw) = MemoryBus::new();
    bus.handle(
        services::ALLOCATOR,
        methods::START_VM,
        |req: StartVmRequest, _bus: &MemoryBus| StartVmResponse {
            success: true,
            failure_reason: String::new(),
            vm_info: Some(VmInfo {
                cid: 42,
                share_handle: 3,
                disk_path: format!("/disks/{}.img", req.name),
            }),
        },
    );
    bus.handle(
        services::ALLOCATOR,
        methods::LIST_VM_DISKS,
        |_req: ListVmDisksRequest, _bus: &MemoryBus| ListVmDisksResponse {
            success: true,
            failure_reason: String::new(),
            images: vec![
                VmDiskInfo {
                    name: "vm1".into(),
                    path: "/disks/vm1.img".into(),
                    size: 20 << 30,
                },
                VmDiskInfo {
                    name: "vm2".into(),
                    path: "/disks/vm2.img".into(),
                    size: 8 << 30,
                },
            ],
        },
    );

    let config = OrchConfig {
        remote_shell: dir.join("missing-vsh"),
        log_dir: dir.to_path_buf(),
        ..OrchConfig::default()
    };
    let session = Session::new(config, OWNER, bus.clone(), raw);
    (bus, session)
}

async fn running_vm(session: &Session, name: &str) -> Vm {
    let mut vm = Vm::new(session.clone(), name, false, 0);
    vm.start(&ctx()).await.unwrap();
    vm
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn handle_start(bus: &MemoryBus, emit_started: bool) {
    bus.handle(
        services::CONTAINERS,
        methods::START_LXD_CONTAINER,
        move |req: StartLxdContainerRequest, bus: &MemoryBus| {
            assert!(req.async_start);
            if emit_started {
                bus.emit(LxdContainerStartingSignal {
                    key: key(&req.vm_name, &req.container_name),
                    status: StartingStatus::Started,
                    failure_reason: String::new(),
                });
            }
            StartLxdContainerResponse {
                status: StartStatus::Starting,
                failure_reason: String::new(),
            }
        },
    );
}

#[tokio::test]
async fn test_vm_start_reports_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let (_bus, session) = session(dir.path());

    let vm = running_vm(&session, "vm1").await;

    assert!(vm.is_running());
    assert_eq!(vm.context_id().unwrap(), 42);
    assert_eq!(vm.disk_path().unwrap(), "/disks/vm1.img");
    assert_eq!(vm.disk_size().unwrap(), 20 << 30);
    assert_eq!(vm.path_sharing().unwrap().share_handle(), 3);
}

#[tokio::test]
async fn test_create_with_progress_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    bus.handle(
        services::CONTAINERS,
        methods::CREATE_LXD_CONTAINER,
        |req: CreateLxdContainerRequest, bus: &MemoryBus| {
            let key = key(&req.vm_name, &req.container_name);
            for pct in [10, 55, 100] {
                bus.emit(LxdContainerDownloadingSignal {
                    key: key.clone(),
                    status: DownloadingStatus::Downloading,
                    download_progress: pct,
                    failure_reason: String::new(),
                });
            }
            bus.emit(LxdContainerCreatedSignal {
                key,
                status: CreatedStatus::Created,
                failure_reason: String::new(),
            });
            CreateLxdContainerResponse {
                status: CreateStatus::Creating,
                failure_reason: String::new(),
            }
        },
    );
    let vm = running_vm(&session, "vm1").await;
    let container = Container::new(&vm, "c1", "testuser");

    let mut watcher = CreationWatcher::new(&container).await.unwrap();
    container
        .create(&ctx(), &ImageSource::from_config(session.config()))
        .await
        .unwrap();

    assert_eq!(watcher.wait_for_download(&ctx(), 55).await.unwrap(), 55);
    assert_eq!(watcher.wait_for_download(&ctx(), -1).await.unwrap(), 100);
    watcher.wait_for_creation(&ctx()).await.unwrap();
    watcher.close().await.unwrap();

    assert_eq!(container.state(), ContainerState::Created);
    settle().await;
    assert_eq!(bus.active_matches(), 0);
}

#[tokio::test]
async fn test_start_and_wait_reaches_ready() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    handle_start(&bus, true);
    bus.handle(
        services::CONTAINERS,
        methods::SET_UP_LXD_CONTAINER_USER,
        |req: SetUpLxdContainerUserRequest, bus: &MemoryBus| {
            bus.emit(ContainerStartedSignal {
                key: key(&req.vm_name, &req.container_name),
                container_username: req.container_username,
                ipv4_address: Some("100.115.92.2".into()),
            });
            SetUpLxdContainerUserResponse {
                status: SetUpUserStatus::Exists,
                failure_reason: String::new(),
            }
        },
    );
    let vm = running_vm(&session, "vm1").await;
    let container = Container::new(&vm, "c1", "testuser");

    container.start_and_wait(&ctx(), dir.path()).await.unwrap();

    assert_eq!(container.state(), ContainerState::Ready);
    settle().await;
    assert_eq!(bus.active_matches(), 0);
}

#[tokio::test]
async fn test_start_and_wait_fails_when_user_setup_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    handle_start(&bus, true);
    bus.handle(
        services::CONTAINERS,
        methods::SET_UP_LXD_CONTAINER_USER,
        |req: SetUpLxdContainerUserRequest, bus: &MemoryBus| {
            bus.emit(ContainerStartedSignal {
                key: key(&req.vm_name, &req.container_name),
                container_username: req.container_username,
                ipv4_address: None,
            });
            SetUpLxdContainerUserResponse {
                status: SetUpUserStatus::Failed,
                failure_reason: "useradd exited 1".into(),
            }
        },
    );
    let vm = running_vm(&session, "vm1").await;
    let container = Container::new(&vm, "c1", "testuser");

    let err = container.start_and_wait(&ctx(), dir.path()).await.unwrap_err();

    assert!(err.is_rejected(), "unexpected error: {}", err);
    assert!(err.to_string().contains("useradd exited 1"));
    assert!(!container.log_path(dir.path()).exists());
    assert_ne!(container.state(), ContainerState::Ready);
    settle().await;
    assert_eq!(bus.active_matches(), 0);
}

#[tokio::test]
async fn test_interleaved_starts_resolve_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    handle_start(&bus, false);
    let vm1 = running_vm(&session, "vm1").await;
    let vm2 = running_vm(&session, "vm2").await;
    let c1 = Container::new(&vm1, "c1", "testuser");
    let c2 = Container::new(&vm2, "c2", "testuser");

    let emitter = {
        let bus = bus.clone();
        async move {
            while bus.match_count(signals::LXD_CONTAINER_STARTING) < 2 {
                tokio::task::yield_now().await;
            }
            // Second container finishes first and its failure must not leak.
            bus.emit(LxdContainerStartingSignal {
                key: key("vm2", "c2"),
                status: StartingStatus::Failed,
                failure_reason: "cgroup setup failed".into(),
            });
            bus.emit(LxdContainerStartingSignal {
                key: key("vm1", "c1"),
                status: StartingStatus::Started,
                failure_reason: String::new(),
            });
        }
    };

    let (ctx1, ctx2) = (ctx(), ctx());
    let (r1, r2, ()) = tokio::join!(c1.start(&ctx1), c2.start(&ctx2), emitter);

    r1.unwrap();
    let err = r2.unwrap_err();
    assert!(matches!(err.root(), Error::Failed { .. }));
    assert!(err.to_string().contains("cgroup setup failed"));
    assert!(err.to_string().contains("vm2/c2"));
    assert_eq!(c1.state(), ContainerState::Running);
}

#[tokio::test]
async fn test_abandoned_create_leaves_no_match_rules() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    bus.handle(
        services::CONTAINERS,
        methods::CREATE_LXD_CONTAINER,
        |_req: CreateLxdContainerRequest, _bus: &MemoryBus| CreateLxdContainerResponse {
            status: CreateStatus::Creating,
            failure_reason: String::new(),
        },
    );
    let vm = running_vm(&session, "vm1").await;
    let container = Container::new(&vm, "c1", "testuser");
    let image = ImageSource::from_config(session.config());

    let ctx = Context::background();
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), container.create(&ctx, &image)).await;
    assert!(abandoned.is_err());

    settle().await;
    assert_eq!(bus.active_matches(), 0);
    assert_eq!(session.dispatcher().waiter_count(), 0);
}

#[tokio::test]
async fn test_create_failure_reason_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    bus.handle(
        services::CONTAINERS,
        methods::CREATE_LXD_CONTAINER,
        |req: CreateLxdContainerRequest, bus: &MemoryBus| {
            bus.emit(LxdContainerCreatedSignal {
                key: key(&req.vm_name, &req.container_name),
                status: CreatedStatus::Failed,
                failure_reason: "disk full".into(),
            });
            CreateLxdContainerResponse {
                status: CreateStatus::Creating,
                failure_reason: String::new(),
            }
        },
    );
    let vm = running_vm(&session, "vm1").await;
    let container = Container::new(&vm, "c1", "testuser");

    let err = container
        .create(&ctx(), &ImageSource::from_config(session.config()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("disk full"));
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn test_install_package_waits_for_success() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, session) = session(dir.path());
    bus.handle(
        services::CONTAINERS,
        methods::INSTALL_LINUX_PACKAGE,
        |req: InstallLinuxPackageRequest, bus: &MemoryBus| {
            let key = key(&req.vm_name, &req.container_name);
            for (status, pct) in [
                (InstallStatus::Downloading, 30),
                (InstallStatus::Installing, 80),
                (InstallStatus::Succeeded, 100),
            ] {
                bus.emit(InstallLinuxPackageProgressSignal {
                    key: key.clone(),
                    status,
                    progress_percent: pct,
                    failure_details: String::new(),
                });
            }
            PackageOperationResponse {
                status: PackageRequestStatus::Started,
                failure_reason: String::new(),
            }
        },
    );
    let vm = running_vm(&session, "vm1").await;
    let container = Container::new(&vm, "c1", "testuser");

    container
        .install_package(&ctx(), "/tmp/cros-tast.deb")
        .await
        .unwrap();

    settle().await;
    assert_eq!(bus.active_matches(), 0);
}
