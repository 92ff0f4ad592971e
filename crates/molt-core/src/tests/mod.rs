//! Test infrastructure for the restart handoff.
//!
//! Mocks for the descriptor table, spawner and service live in [`mocks`];
//! [`handoff`] drives predecessor and successor together in one process.

pub mod handoff;

pub use mocks::{MockService, MockSpawner, SlotMap};
