//! vmorch - VM and container lifecycle orchestration client.
//!
//! Operations are requested over a message bus and most of them complete
//! asynchronously: the method reply only says whether the request was
//! accepted, and completion arrives later as a notification carrying the
//! (VM, container, owner) correlation key. The crate is layered as:
//!
//! - [`bus`]: transport for method calls, match rules and raw notifications
//! - [`signal`]: fan-out dispatcher and typed, deadline-bound waits
//! - [`session`]: owner id, transport, dispatcher and allocator in one place
//! - [`vm`], [`container`]: lifecycle handles built on the above
//! - [`sharing`], [`command`]: path sharing and remote command execution

#![warn(missing_docs)]

pub mod allocator;
pub mod bus;
pub mod command;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod session;
pub mod sharing;
pub mod signal;
pub mod vm;

pub use container::{Container, ContainerState, CreationWatcher, ImageSource};
pub use context::Context;
pub use error::{Error, Result};
pub use session::Session;
pub use sharing::SharedPathGrant;
pub use vm::{Vm, VmState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
