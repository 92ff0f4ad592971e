// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # molt-core
//!
//! Zero-downtime restart primitives for Unix servers.
//!
//! A running process (the *predecessor*) registers the listeners and files
//! it serves from. On SIGHUP it spawns a fresh copy of itself (the
//! *successor*) that inherits every registered descriptor at slot `3 + i`,
//! with a JSON manifest describing them in an environment variable. Once
//! the successor is ready it sends SIGINT to its parent, which drains and
//! exits. Listening sockets are never closed in between, so no connection
//! attempt is refused.
//!
//! - [`Registry`] collects what the next successor inherits
//! - [`Manifest`] is the record list passed through the environment
//! - [`Inheritance`] is what a successor received, keyed by address or path
//! - [`Service`] is the trait a server implements
//! - [`start`] runs a service for the lifetime of the process
//!
//! ## Example
//!
//! ```rust,ignore
//! use molt_core::{RestartConfig, start};
//!
//! #[tokio::main]
//! async fn main() {
//!     start(RestartConfig::default(), MyServer::default()).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Allow significant_drop_tightening - overly aggressive for async code with locks
#![allow(clippy::significant_drop_tightening)]

#[cfg(not(unix))]
compile_error!("molt-core passes descriptors across exec and only supports Unix targets");

pub mod config;
pub mod error;
pub mod inherit;
pub mod launcher;
pub mod manifest;
pub mod predecessor;
pub mod record;
pub mod service;
pub mod shutdown;
pub mod signal;
pub mod spawn;
pub mod successor;
#[cfg(test)]
pub mod tests;
pub mod types;

pub use config::RestartConfig;
pub use error::{CallbackError, CallbackPhase, MoltError, Result};
pub use inherit::{
    InheritedFds, InheritedHandle, InheritedListener, InheritedResource, Inheritance, ProcessFds,
};
pub use launcher::{Launcher, start};
pub use manifest::{DEFAULT_MANIFEST_VAR, Manifest};
pub use predecessor::{Predecessor, ShutdownReport};
pub use record::{InheritableListener, RecordHandle, Registry, ResourceRecord};
pub use service::Service;
pub use shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownContext};
pub use signal::{SignalContext, SignalHandle};
pub use spawn::{ChildFdTable, ProcessImage, ProcessSpawner, SpawnRequest, Spawner};
pub use successor::{ParentLink, bring_up};
pub use types::{FIRST_INHERITED_FD, ResourceKind, Role, RoleState, Signal, SignalClass, Transport};
