//! Bring-up of a spawned successor.
//!
//! The successor decodes its manifest, binds every record to its inherited
//! slot, hands the result to `init_child`, and once that succeeds tells its
//! parent to stop. From then on it is a predecessor in its own right.

use nix::sys::signal::{Signal as NixSignal, kill};
use nix::unistd::{Pid, getppid};

use crate::error::{CallbackPhase, MoltError, Result};
use crate::inherit::{InheritedFds, Inheritance};
use crate::manifest::Manifest;
use crate::record::Registry;
use crate::service::Service;

/// The process to notify once this successor is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pid: Option<Pid>,
}

impl ParentLink {
    /// Links to the parent of this process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: Some(getppid()),
        }
    }

    /// Links to an explicit pid.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Some(Pid::from_raw(pid as i32)),
        }
    }

    /// A link that notifies nobody.
    #[must_use]
    pub const fn detached() -> Self {
        Self { pid: None }
    }

    /// Linked pid, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid.map(|pid| pid.as_raw() as u32)
    }

    /// Sends SIGINT to the linked process.
    ///
    /// Returns `false` if the link is detached.
    ///
    /// # Errors
    /// Returns `Signal` if the parent is gone (re-parented to init) or the
    /// signal cannot be delivered.
    pub fn notify_ready(&self) -> Result<bool> {
        let Some(pid) = self.pid else {
            return Ok(false);
        };
        if pid.as_raw() <= 1 {
            return Err(MoltError::signal(format!(
                "parent pid {pid} is not a predecessor"
            )));
        }
        kill(pid, NixSignal::SIGINT)
            .map_err(|e| MoltError::signal(format!("cannot signal parent {pid}: {e}")))?;
        tracing::info!(parent = pid.as_raw(), "notified parent");
        Ok(true)
    }
}

/// Rebuilds inherited resources and runs `init_child`.
///
/// On success the parent has been asked to shut down and the returned
/// registry holds what the next successor will inherit.
///
/// # Errors
/// `ManifestCorrupt` if `manifest` cannot be decoded, or the `init_child`
/// error wrapped as `Callback { phase: InitChild, .. }`. No signal is sent
/// to the parent in either case.
pub async fn bring_up<S: Service + ?Sized>(
    manifest: &str,
    fds: &mut dyn InheritedFds,
    parent: &ParentLink,
    service: &mut S,
) -> Result<Registry> {
    let manifest = Manifest::decode(manifest)?;
    let mut inheritance = Inheritance::bind(&manifest, fds);
    tracing::info!(
        records = manifest.len(),
        bound = inheritance.len(),
        failed = inheritance.failures().len(),
        "bound inherited resources"
    );

    let mut registry = Registry::new();
    service
        .init_child(&mut inheritance, &mut registry)
        .await
        .map_err(|source| MoltError::callback(CallbackPhase::InitChild, source))?;

    let closed = inheritance.release();
    if closed > 0 {
        tracing::info!(closed, "closed inherited resources not taken by init_child");
    }

    if let Err(err) = parent.notify_ready() {
        tracing::warn!(error = %err, "successor ready but parent not notified");
    }
    Ok(registry)
}
