//! # molt-test
//!
//! Testing infrastructure for the Molt restart framework.
//!
//! This crate provides:
//! - **molt-probe**: a server that answers every connection with its pid
//!   and reports lifecycle events on stdout
//! - **Restart harness**: spawns the probe, follows its events across
//!   generations, and sends it signals
//!
//! ## Example
//!
//! ```rust,ignore
//! use molt_test::{ProbeEvent, RestartHarness};
//!
//! let mut harness = RestartHarness::spawn(env!("CARGO_BIN_EXE_molt-probe")).await?;
//! let (port, pid) = harness.listening(timeout).await?;
//! harness.signal(pid, molt_core::Signal::Hup)?;
//! let successor = harness.ready(timeout).await?;
//! assert_eq!(harness.fetch_pid(port).await?, successor);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod harness;

pub use error::{Result, TestError};
pub use harness::{PROBE_ADDRESS, ProbeEvent, RestartHarness};
