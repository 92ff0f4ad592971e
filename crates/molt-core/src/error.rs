//! Error types for molt-core.
//!
//! Failures that would disturb the process currently serving traffic are
//! recoverable and get logged; failures while a new process brings itself up
//! are fatal to that new process only.

use std::fmt;

/// Result type alias for handoff operations.
pub type Result<T> = std::result::Result<T, MoltError>;

/// Boxed error returned by caller-supplied [`Service`](crate::Service) callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The caller-supplied callback that produced a [`MoltError::Callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPhase {
    /// `init_parent` in a fresh predecessor.
    InitParent,
    /// `init_child` in a successor.
    InitChild,
    /// `quit` on the shutdown path of either role.
    Quit,
}

impl fmt::Display for CallbackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitParent => "init_parent",
            Self::InitChild => "init_child",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Error type for registration, spawn, inheritance and the restart lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum MoltError {
    /// The successor process could not be created.
    #[error("failed to spawn successor: {0}")]
    SpawnFailed(String),

    /// The resource cannot be inherited across exec.
    #[error("unsupported resource kind: {0}")]
    UnsupportedResourceKind(String),

    /// A listener could not be turned into a plain descriptor.
    #[error("listener conversion failed for {address}: {reason}")]
    ListenerConversionFailed {
        /// Address the listener was registered under.
        address: String,
        /// Underlying cause.
        reason: String,
    },

    /// A record with the same lookup key is already registered.
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),

    /// The inheritance manifest could not be decoded.
    #[error("inheritance manifest corrupt: {0}")]
    ManifestCorrupt(String),

    /// An inherited descriptor could not be bound to its record.
    #[error("failed to bind slot {slot} ({name}): {reason}")]
    ResourceBindFailed {
        /// Descriptor slot the record maps to.
        slot: i32,
        /// Record name.
        name: String,
        /// Underlying cause.
        reason: String,
    },

    /// A caller-supplied callback failed.
    #[error("{phase} callback failed: {source}")]
    Callback {
        /// Which callback failed.
        phase: CallbackPhase,
        /// Error returned by the callback, unchanged.
        #[source]
        source: CallbackError,
    },

    /// Signal installation or delivery error.
    #[error("signal error: {0}")]
    Signal(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MoltError {
    /// Creates a spawn error.
    #[must_use]
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Creates an unsupported resource error.
    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedResourceKind(msg.into())
    }

    /// Creates a listener conversion error.
    #[must_use]
    pub fn conversion(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ListenerConversionFailed {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a corrupt manifest error.
    #[must_use]
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::ManifestCorrupt(msg.into())
    }

    /// Creates a bind error for one inherited slot.
    #[must_use]
    pub fn bind(slot: i32, name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ResourceBindFailed {
            slot,
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Wraps a callback error, keeping it as the source.
    #[must_use]
    pub fn callback(phase: CallbackPhase, source: CallbackError) -> Self {
        Self::Callback { phase, source }
    }

    /// Creates a signal error.
    #[must_use]
    pub fn signal(msg: impl Into<String>) -> Self {
        Self::Signal(msg.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Returns true if the serving process logs this error and carries on.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed(_)
                | Self::UnsupportedResourceKind(_)
                | Self::ListenerConversionFailed { .. }
                | Self::DuplicateResource(_)
                | Self::ResourceBindFailed { .. }
        )
    }

    /// Returns true if this error ends the current process's bring-up.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ManifestCorrupt(_)
                | Self::Config(_)
                | Self::Callback {
                    phase: CallbackPhase::InitParent | CallbackPhase::InitChild,
                    ..
                }
        )
    }

    /// Exit status used by [`start`](crate::start) when this error ends the process.
    ///
    /// A failed `quit` maps to `0`: the drain error is reported, not turned
    /// into a distinct status.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ManifestCorrupt(_) => 2,
            Self::Callback {
                phase: CallbackPhase::InitChild,
                ..
            } => 3,
            Self::Callback {
                phase: CallbackPhase::Quit,
                ..
            } => 0,
            _ => 1,
        }
    }
}
