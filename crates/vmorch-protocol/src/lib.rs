//! Wire types for vmorch service calls and container lifecycle notifications.
//!
//! This crate defines the messages exchanged between the vmorch client and
//! the background services that own VMs, containers and shared paths.
//!
//! # Protocol Overview
//!
//! Every payload (method request, method response, notification) is a
//! JSON document prefixed with a 4-byte big-endian length header.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 BE)  | JSON payload      |
//! +----------------+-------------------+
//! ```
//!
//! Payloads travel inside [`BusFrame`]s. A frame body is the base64 form of
//! a length-prefixed payload, so the bus itself never interprets it.

#![deny(missing_docs)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Well-known service names.
pub mod services {
    /// Allocator service: owns VM instances and disk images.
    pub const ALLOCATOR: &str = "org.vmorch.Allocator";
    /// Container service: creates and drives containers inside VMs.
    pub const CONTAINERS: &str = "org.vmorch.Containers";
    /// Path-sharing service: exposes host paths into the sandbox.
    pub const PATH_SHARING: &str = "org.vmorch.PathSharing";
}

/// Object paths that emit notifications.
pub mod paths {
    /// Object path of the container service.
    pub const CONTAINERS: &str = "/org/vmorch/Containers";
}

/// Method names.
pub mod methods {
    /// Start a VM.
    pub const START_VM: &str = "StartVm";
    /// Stop a VM.
    pub const STOP_VM: &str = "StopVm";
    /// List VM disk images.
    pub const LIST_VM_DISKS: &str = "ListVmDisks";
    /// Create an LXD container.
    pub const CREATE_LXD_CONTAINER: &str = "CreateLxdContainer";
    /// Start an LXD container.
    pub const START_LXD_CONTAINER: &str = "StartLxdContainer";
    /// Set up the default user in a container.
    pub const SET_UP_LXD_CONTAINER_USER: &str = "SetUpLxdContainerUser";
    /// Install a Linux package file.
    pub const INSTALL_LINUX_PACKAGE: &str = "InstallLinuxPackage";
    /// Uninstall the package owning a desktop file.
    pub const UNINSTALL_PACKAGE_OWNING_FILE: &str = "UninstallPackageOwningFile";
    /// Share a host path.
    pub const SHARE_PATH: &str = "SharePath";
    /// Unshare a host path.
    pub const UNSHARE_PATH: &str = "UnsharePath";
}

/// Notification (signal) names.
pub mod signals {
    /// Container creation finished (success or failure).
    pub const LXD_CONTAINER_CREATED: &str = "LxdContainerCreated";
    /// Container image download progress.
    pub const LXD_CONTAINER_DOWNLOADING: &str = "LxdContainerDownloading";
    /// Container start progress.
    pub const LXD_CONTAINER_STARTING: &str = "LxdContainerStarting";
    /// Container is up and its user session is reachable.
    pub const CONTAINER_STARTED: &str = "ContainerStarted";
    /// Package install progress.
    pub const INSTALL_LINUX_PACKAGE_PROGRESS: &str = "InstallLinuxPackageProgress";
    /// Package uninstall progress.
    pub const UNINSTALL_PACKAGE_PROGRESS: &str = "UninstallPackageProgress";
}

// ============================================================================
// Bus Frames
// ============================================================================

/// Bus match rule for a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchRule {
    /// Interface emitting the signal.
    pub interface: String,
    /// Object path emitting the signal.
    pub path: String,
    /// Signal name.
    pub member: String,
}

impl MatchRule {
    /// Match rule for a container service signal.
    pub fn container_signal(member: &str) -> Self {
        Self {
            interface: services::CONTAINERS.to_string(),
            path: paths::CONTAINERS.to_string(),
            member: member.to_string(),
        }
    }
}

impl std::fmt::Display for MatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "type='signal',interface='{}',path='{}',member='{}'",
            self.interface, self.path, self.member
        )
    }
}

/// Frames exchanged with the bus over a single connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// Method call to a service.
    Call {
        /// Serial for correlating the reply.
        serial: u64,
        /// Destination service name.
        destination: String,
        /// Method name.
        method: String,
        /// Base64 of the length-prefixed request payload.
        body: String,
    },

    /// Register a match rule.
    AddMatch {
        /// Serial for correlating the reply.
        serial: u64,
        /// Rule to register.
        rule: MatchRule,
    },

    /// Release a match rule.
    RemoveMatch {
        /// Serial for correlating the reply.
        serial: u64,
        /// Rule to release.
        rule: MatchRule,
    },

    /// Successful reply.
    Reply {
        /// Serial of the originating frame.
        serial: u64,
        /// Base64 of the length-prefixed response payload (empty for match replies).
        #[serde(default)]
        body: String,
    },

    /// Error reply.
    Error {
        /// Serial of the originating frame.
        serial: u64,
        /// Error message.
        message: String,
    },

    /// Notification delivered to a matching subscriber.
    Signal {
        /// Interface emitting the signal.
        interface: String,
        /// Object path emitting the signal.
        path: String,
        /// Signal name.
        member: String,
        /// Base64 of the length-prefixed notification payload.
        payload: String,
    },
}

/// Encode raw bytes for a frame body.
pub fn encode_body(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a frame body back into raw bytes.
pub fn decode_body(body: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(body)
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

// ============================================================================
// Correlation
// ============================================================================

/// The (VM name, container name, owner id) triple matching requests to notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// VM name.
    pub vm_name: String,
    /// Container name.
    pub container_name: String,
    /// Owner id of the session.
    pub owner_id: String,
}

impl CorrelationKey {
    /// Create a new correlation key.
    pub fn new(
        vm_name: impl Into<String>,
        container_name: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            container_name: container_name.into(),
            owner_id: owner_id.into(),
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.vm_name, self.container_name, self.owner_id)
    }
}

// ============================================================================
// Allocator Protocol
// ============================================================================

/// Request to start a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartVmRequest {
    /// Owner id of the session.
    pub owner_id: String,
    /// VM name.
    pub name: String,
    /// Enable GPU acceleration.
    pub enable_gpu: bool,
    /// Requested disk size in bytes (0 lets the allocator decide).
    pub disk_size: u64,
    /// Directory holding the VM kernel and rootfs images.
    pub component_path: String,
}

/// Allocator details about a started VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    /// vsock context id.
    pub cid: u32,
    /// Handle scoping path-sharing requests to this VM.
    pub share_handle: u32,
    /// Path of the VM's stateful disk image.
    pub disk_path: String,
}

/// Response to [`StartVmRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartVmResponse {
    /// Whether the VM started.
    pub success: bool,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
    /// VM details on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_info: Option<VmInfo>,
}

/// Request to stop a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopVmRequest {
    /// Owner id of the session.
    pub owner_id: String,
    /// VM name.
    pub name: String,
}

/// Response to [`StopVmRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopVmResponse {
    /// Whether the VM stopped.
    pub success: bool,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Request listing the owner's VM disk images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVmDisksRequest {
    /// Owner id of the session.
    pub owner_id: String,
}

/// One VM disk image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDiskInfo {
    /// VM name the disk belongs to.
    pub name: String,
    /// Disk image path.
    pub path: String,
    /// Disk size in bytes.
    pub size: u64,
}

/// Response to [`ListVmDisksRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVmDisksResponse {
    /// Whether the listing succeeded.
    pub success: bool,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
    /// Disk images.
    #[serde(default)]
    pub images: Vec<VmDiskInfo>,
}

// ============================================================================
// Container Protocol
// ============================================================================

/// Request to create a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLxdContainerRequest {
    /// VM name.
    pub vm_name: String,
    /// Container name.
    pub container_name: String,
    /// Owner id of the session.
    pub owner_id: String,
    /// Image server URL.
    pub image_server: String,
    /// Image alias (e.g. "debian/bookworm").
    pub image_alias: String,
}

/// Synchronous status of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateStatus {
    /// Unknown status.
    #[default]
    Unknown,
    /// Creation accepted; completion arrives as a notification.
    Creating,
    /// Container already exists.
    Exists,
    /// Request failed.
    Failed,
}

/// Response to [`CreateLxdContainerRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateLxdContainerResponse {
    /// Request status.
    pub status: CreateStatus,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Request to start a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartLxdContainerRequest {
    /// VM name.
    pub vm_name: String,
    /// Container name.
    pub container_name: String,
    /// Owner id of the session.
    pub owner_id: String,
    /// Report completion through notifications instead of blocking.
    #[serde(rename = "async")]
    pub async_start: bool,
}

/// Synchronous status of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartStatus {
    /// Unknown status.
    #[default]
    Unknown,
    /// Container is already running.
    Running,
    /// Container is starting.
    Starting,
    /// Container filesystem is being remapped before start.
    Remapping,
    /// Request failed.
    Failed,
}

/// Response to [`StartLxdContainerRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartLxdContainerResponse {
    /// Request status.
    pub status: StartStatus,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Request to set up the default container user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetUpLxdContainerUserRequest {
    /// VM name.
    pub vm_name: String,
    /// Container name.
    pub container_name: String,
    /// Owner id of the session.
    pub owner_id: String,
    /// User name to provision.
    pub container_username: String,
}

/// Status of a user setup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetUpUserStatus {
    /// Unknown status.
    #[default]
    Unknown,
    /// User was created.
    Success,
    /// User already existed.
    Exists,
    /// Request failed.
    Failed,
}

/// Response to [`SetUpLxdContainerUserRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetUpLxdContainerUserResponse {
    /// Request status.
    pub status: SetUpUserStatus,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Request to install a package file already present in the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallLinuxPackageRequest {
    /// VM name.
    pub vm_name: String,
    /// Container name.
    pub container_name: String,
    /// Owner id of the session.
    pub owner_id: String,
    /// Path of the package file inside the container.
    pub file_path: String,
}

/// Request to uninstall the package owning a desktop file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UninstallPackageOwningFileRequest {
    /// VM name.
    pub vm_name: String,
    /// Container name.
    pub container_name: String,
    /// Owner id of the session.
    pub owner_id: String,
    /// Desktop file id of an application owned by the package.
    pub desktop_file_id: String,
}

/// Synchronous status of an install or uninstall request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageRequestStatus {
    /// Request failed.
    #[default]
    Failed,
    /// Operation started; progress arrives as notifications.
    Started,
    /// Another package operation is running.
    BlockingOperationInProgress,
}

/// Response to an install or uninstall request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageOperationResponse {
    /// Request status.
    pub status: PackageRequestStatus,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

// ============================================================================
// Path Sharing Protocol
// ============================================================================

/// Host storage root a shared path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageLocation {
    /// The user's files.
    #[default]
    MyFiles,
    /// The user's downloads.
    Downloads,
    /// Removable media.
    Removable,
}

/// Request to share a host path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePathRequest {
    /// Share handle of the VM.
    pub handle: u32,
    /// Owner id of the session.
    pub owner_id: String,
    /// Storage root.
    pub location: StorageLocation,
    /// Path relative to the storage root.
    pub path: String,
    /// Whether the guest may write.
    pub writable: bool,
}

/// Response to [`SharePathRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharePathResponse {
    /// Whether the path was shared.
    pub success: bool,
    /// Path inside the sandbox on success.
    #[serde(default)]
    pub path: String,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Request to unshare a host path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsharePathRequest {
    /// Share handle of the VM.
    pub handle: u32,
    /// Owner id of the session.
    pub owner_id: String,
    /// Storage root.
    pub location: StorageLocation,
    /// Path relative to the storage root.
    pub path: String,
}

/// Response to [`UnsharePathRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsharePathResponse {
    /// Whether the path was unshared.
    pub success: bool,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

// ============================================================================
// Notifications
// ============================================================================

/// Terminal status of a container creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreatedStatus {
    /// Unknown status.
    #[default]
    Unknown,
    /// Container created.
    Created,
    /// Image download timed out.
    DownloadTimedOut,
    /// Creation cancelled.
    Cancelled,
    /// Creation failed.
    Failed,
}

/// Sent when container creation finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LxdContainerCreatedSignal {
    /// Correlation key.
    #[serde(flatten)]
    pub key: CorrelationKey,
    /// Terminal status.
    pub status: CreatedStatus,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Status of an image download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadingStatus {
    /// Download in progress.
    #[default]
    Downloading,
    /// Download timed out.
    DownloadTimedOut,
    /// Download cancelled.
    Cancelled,
    /// Download failed.
    Failed,
}

/// Sent while a container image downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LxdContainerDownloadingSignal {
    /// Correlation key.
    #[serde(flatten)]
    pub key: CorrelationKey,
    /// Download status.
    pub status: DownloadingStatus,
    /// Completion percentage (0-100).
    pub download_progress: i32,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Status of a container start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingStatus {
    /// Unknown status.
    #[default]
    Unknown,
    /// Still starting.
    Starting,
    /// Container started.
    Started,
    /// Start cancelled.
    Cancelled,
    /// Start failed.
    Failed,
}

/// Sent when a container start progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LxdContainerStartingSignal {
    /// Correlation key.
    #[serde(flatten)]
    pub key: CorrelationKey,
    /// Start status.
    pub status: StartingStatus,
    /// Reason for failure.
    #[serde(default)]
    pub failure_reason: String,
}

/// Sent once the container is fully up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStartedSignal {
    /// Correlation key.
    #[serde(flatten)]
    pub key: CorrelationKey,
    /// Default user of the container.
    #[serde(default)]
    pub container_username: String,
    /// Container IPv4 address, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

/// Status of a package install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStatus {
    /// Install finished.
    Succeeded,
    /// Install failed.
    Failed,
    /// Downloading dependencies.
    Downloading,
    /// Installing.
    Installing,
}

/// Sent while a package install progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallLinuxPackageProgressSignal {
    /// Correlation key.
    #[serde(flatten)]
    pub key: CorrelationKey,
    /// Install status.
    pub status: InstallStatus,
    /// Completion percentage (0-100).
    #[serde(default)]
    pub progress_percent: u32,
    /// Failure details.
    #[serde(default)]
    pub failure_details: String,
}

/// Status of a package uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UninstallStatus {
    /// Uninstall finished.
    Succeeded,
    /// Uninstall failed.
    Failed,
    /// Uninstalling.
    Uninstalling,
}

/// Sent while a package uninstall progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UninstallPackageProgressSignal {
    /// Correlation key.
    #[serde(flatten)]
    pub key: CorrelationKey,
    /// Uninstall status.
    pub status: UninstallStatus,
    /// Completion percentage (0-100).
    #[serde(default)]
    pub progress_percent: u32,
    /// Failure details.
    #[serde(default)]
    pub failure_details: String,
}

/// A decoded notification of any known signal.
#[derive(Debug, Clone)]
pub enum Notification {
    /// See [`LxdContainerCreatedSignal`].
    Created(LxdContainerCreatedSignal),
    /// See [`LxdContainerDownloadingSignal`].
    Downloading(LxdContainerDownloadingSignal),
    /// See [`LxdContainerStartingSignal`].
    Starting(LxdContainerStartingSignal),
    /// See [`ContainerStartedSignal`].
    Started(ContainerStartedSignal),
    /// See [`InstallLinuxPackageProgressSignal`].
    InstallProgress(InstallLinuxPackageProgressSignal),
    /// See [`UninstallPackageProgressSignal`].
    UninstallProgress(UninstallPackageProgressSignal),
}

impl Notification {
    /// Decode a raw payload delivered under the given signal name.
    pub fn decode(member: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        match member {
            signals::LXD_CONTAINER_CREATED => decode_message(payload).map(Self::Created),
            signals::LXD_CONTAINER_DOWNLOADING => decode_message(payload).map(Self::Downloading),
            signals::LXD_CONTAINER_STARTING => decode_message(payload).map(Self::Starting),
            signals::CONTAINER_STARTED => decode_message(payload).map(Self::Started),
            signals::INSTALL_LINUX_PACKAGE_PROGRESS => {
                decode_message(payload).map(Self::InstallProgress)
            }
            signals::UNINSTALL_PACKAGE_PROGRESS => {
                decode_message(payload).map(Self::UninstallProgress)
            }
            other => Err(DecodeError::UnknownSignal(other.to_string())),
        }
    }

    /// Encode the notification payload (length-prefixed JSON).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Created(s) => encode_message(s),
            Self::Downloading(s) => encode_message(s),
            Self::Starting(s) => encode_message(s),
            Self::Started(s) => encode_message(s),
            Self::InstallProgress(s) => encode_message(s),
            Self::UninstallProgress(s) => encode_message(s),
        }
    }

    /// Signal name of this notification.
    pub fn signal(&self) -> &'static str {
        match self {
            Self::Created(_) => signals::LXD_CONTAINER_CREATED,
            Self::Downloading(_) => signals::LXD_CONTAINER_DOWNLOADING,
            Self::Starting(_) => signals::LXD_CONTAINER_STARTING,
            Self::Started(_) => signals::CONTAINER_STARTED,
            Self::InstallProgress(_) => signals::INSTALL_LINUX_PACKAGE_PROGRESS,
            Self::UninstallProgress(_) => signals::UNINSTALL_PACKAGE_PROGRESS,
        }
    }

    /// Correlation key carried by this notification.
    pub fn key(&self) -> &CorrelationKey {
        match self {
            Self::Created(s) => &s.key,
            Self::Downloading(s) => &s.key,
            Self::Starting(s) => &s.key,
            Self::Started(s) => &s.key,
            Self::InstallProgress(s) => &s.key,
            Self::UninstallProgress(s) => &s.key,
        }
    }
}

/// A typed notification record.
pub trait Signal: Sized + Serialize + DeserializeOwned + Send + 'static {
    /// Signal name the record is delivered under.
    const NAME: &'static str;

    /// Correlation key of the record.
    fn key(&self) -> &CorrelationKey;

    /// Extract this record from a decoded notification.
    fn from_notification(notification: Notification) -> Option<Self>;

    /// Wrap this record as a notification.
    fn into_notification(self) -> Notification;
}

macro_rules! impl_signal {
    ($ty:ty, $name:expr, $variant:ident) => {
        impl Signal for $ty {
            const NAME: &'static str = $name;

            fn key(&self) -> &CorrelationKey {
                &self.key
            }

            fn from_notification(notification: Notification) -> Option<Self> {
                match notification {
                    Notification::$variant(s) => Some(s),
                    _ => None,
                }
            }

            fn into_notification(self) -> Notification {
                Notification::$variant(self)
            }
        }
    };
}

impl_signal!(LxdContainerCreatedSignal, signals::LXD_CONTAINER_CREATED, Created);
impl_signal!(LxdContainerDownloadingSignal, signals::LXD_CONTAINER_DOWNLOADING, Downloading);
impl_signal!(LxdContainerStartingSignal, signals::LXD_CONTAINER_STARTING, Starting);
impl_signal!(ContainerStartedSignal, signals::CONTAINER_STARTED, Started);
impl_signal!(
    InstallLinuxPackageProgressSignal,
    signals::INSTALL_LINUX_PACKAGE_PROGRESS,
    InstallProgress
);
impl_signal!(
    UninstallPackageProgressSignal,
    signals::UNINSTALL_PACKAGE_PROGRESS,
    UninstallProgress
);

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a message to wire format (length-prefixed JSON).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a message from wire format.
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    if data.len() < 4 {
        return Err(DecodeError::TooShort);
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if len > MAX_FRAME_SIZE as usize {
        return Err(DecodeError::TooLarge(len));
    }

    if data.len() < 4 + len {
        return Err(DecodeError::Incomplete {
            expected: len,
            got: data.len() - 4,
        });
    }

    serde_json::from_slice(&data[4..4 + len]).map_err(DecodeError::Json)
}

/// Error decoding a wire message.
#[derive(Debug)]
pub enum DecodeError {
    /// Payload is empty.
    Empty,
    /// Data too short to contain length header.
    TooShort,
    /// Frame size exceeds maximum.
    TooLarge(usize),
    /// Incomplete frame.
    Incomplete {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },
    /// JSON parse error.
    Json(serde_json::Error),
    /// Frame body is not valid base64.
    Base64(String),
    /// Signal name has no known record type.
    UnknownSignal(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty payload"),
            DecodeError::TooShort => write!(f, "data too short for length header"),
            DecodeError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Incomplete { expected, got } => {
                write!(f, "incomplete frame: expected {} bytes, got {}", expected, got)
            }
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
            DecodeError::Base64(e) => write!(f, "base64 decode error: {}", e),
            DecodeError::UnknownSignal(name) => write!(f, "unknown signal: {}", name),
        }
    }
}

impl std::error::Error for DecodeError {}
