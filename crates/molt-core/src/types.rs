//! Core types for the restart handoff.
//!
//! Explicit state machines, no implicit transitions.

use serde::{Deserialize, Serialize};

/// Index of the first inherited descriptor in a successor.
///
/// Slots 0-2 are stdin, stdout and stderr. Record `i` of a manifest always
/// lives at slot `FIRST_INHERITED_FD + i`, in both processes.
pub const FIRST_INHERITED_FD: i32 = 3;

/// Returns the child descriptor slot for the record at `index`.
#[must_use]
pub const fn slot_for_index(index: usize) -> i32 {
    FIRST_INHERITED_FD + index as i32
}

/// Returns the manifest index for a child descriptor slot, if the slot is
/// past the standard streams.
#[must_use]
pub const fn index_for_slot(slot: i32) -> Option<usize> {
    if slot < FIRST_INHERITED_FD {
        None
    } else {
        Some((slot - FIRST_INHERITED_FD) as usize)
    }
}

/// Kind of an inheritable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A regular file, keyed by its path.
    PlainFile,
    /// A listening socket, keyed by its address.
    NetworkListener,
}

/// Transport behind a listener-like socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stream-oriented TCP listener.
    Tcp,
    /// Stream-oriented Unix-domain listener.
    Unix,
    /// UDP socket.
    Udp,
    /// Datagram Unix-domain socket.
    UnixDatagram,
}

impl Transport {
    /// Returns true for the stream transports that can be inherited.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp | Self::Unix)
    }

    /// Short label used in record names and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::Udp => "udp",
            Self::UnixDatagram => "unixgram",
        }
    }
}

/// Unix signals the handoff reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Hangup (spawn a successor).
    Hup,
    /// Interrupt (shutdown; also the successor's readiness notification).
    Int,
    /// Quit (shutdown).
    Quit,
    /// Terminate (shutdown).
    Term,
}

impl Signal {
    /// Returns the Unix signal number.
    #[must_use]
    pub const fn as_i32(&self) -> i32 {
        match self {
            Self::Hup => 1,
            Self::Int => 2,
            Self::Quit => 3,
            Self::Term => 15,
        }
    }

    /// Creates a signal from a Unix signal number.
    #[must_use]
    pub const fn from_i32(sig: i32) -> Option<Self> {
        match sig {
            1 => Some(Self::Hup),
            2 => Some(Self::Int),
            3 => Some(Self::Quit),
            15 => Some(Self::Term),
            _ => None,
        }
    }

    /// Classifies the signal for the predecessor state machine.
    #[must_use]
    pub const fn class(&self) -> SignalClass {
        match self {
            Self::Hup => SignalClass::Restart,
            Self::Int | Self::Quit | Self::Term => SignalClass::Shutdown,
        }
    }
}

/// What a signal asks the serving process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Spawn a successor and keep serving.
    Restart,
    /// Drain and terminate.
    Shutdown,
}

/// Role of this process, decided once at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Fresh process, no manifest in the environment.
    Predecessor,
    /// Spawned by a predecessor with an inheritance manifest.
    Successor,
}

impl Role {
    /// Detects the role from the manifest environment value.
    ///
    /// An absent or empty value means a fresh predecessor.
    #[must_use]
    pub fn detect(manifest: Option<&str>) -> Self {
        match manifest {
            Some(value) if !value.is_empty() => Self::Successor,
            _ => Self::Predecessor,
        }
    }
}

/// Lifecycle state of the serving process.
///
/// ```text
/// Serving ──(restart)──▶ Serving
///    │
/// (shutdown)
///    ▼
/// Draining ──▶ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    /// Accepting restart and shutdown signals.
    Serving,
    /// Running the quit callback.
    Draining,
    /// Final; no further signals are processed.
    Terminated,
}

impl RoleState {
    /// Returns true if this is the final state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}
