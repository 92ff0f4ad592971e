//! Molt: zero-downtime restarts for Unix servers.
//!
//! A server hands its listening sockets to a fresh copy of itself on
//! SIGHUP, then drains and exits once the copy is ready.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use molt::prelude::*;
//!
//! // Implement `Service` for your server, then from `main`:
//! // start(RestartConfig::default(), MyServer::default()).await;
//! ```

pub use molt_core as core;

/// Prelude module for common imports.
pub mod prelude {
    pub use molt_core::{
        CallbackError, Inheritance, MoltError, Registry, RestartConfig, Service, ShutdownContext,
        Signal, start,
    };
}
