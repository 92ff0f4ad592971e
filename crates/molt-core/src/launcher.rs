//! Process entry point.
//!
//! [`start`] decides the role of this process once, brings it up through
//! the matching callback, and then serves until shutdown. Bring-up failures
//! end the process with a status that tells the operator what went wrong:
//!
//! | Status | Cause                                      |
//! |--------|--------------------------------------------|
//! | 0      | clean shutdown, including a failed `quit`  |
//! | 1      | `init_parent` or setup failed              |
//! | 2      | inherited manifest could not be decoded    |
//! | 3      | `init_child` failed                        |

use crate::config::RestartConfig;
use crate::error::{CallbackPhase, MoltError, Result};
use crate::inherit::{InheritedFds, ProcessFds};
use crate::predecessor::{Predecessor, ShutdownReport};
use crate::record::Registry;
use crate::service::Service;
use crate::signal::SignalContext;
use crate::spawn::{ProcessImage, ProcessSpawner, Spawner};
use crate::successor::{ParentLink, bring_up};
use crate::types::Role;

/// One process lifetime: bring-up in the detected role, then serving.
pub struct Launcher {
    config: RestartConfig,
    manifest: Option<String>,
    parent: ParentLink,
    fds: Option<Box<dyn InheritedFds>>,
    spawner: Option<Box<dyn Spawner>>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .field("role", &self.role())
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl Launcher {
    /// Creates a launcher for an explicit manifest value.
    #[must_use]
    pub fn new(config: RestartConfig, manifest: Option<String>) -> Self {
        let parent = if config.notify_parent {
            ParentLink::current()
        } else {
            ParentLink::detached()
        };
        Self {
            config,
            manifest,
            parent,
            fds: None,
            spawner: None,
        }
    }

    /// Creates a launcher reading the manifest from the environment.
    #[must_use]
    pub fn from_env(config: RestartConfig) -> Self {
        let manifest = std::env::var(&config.manifest_var).ok();
        Self::new(config, manifest)
    }

    /// Role this process will take.
    #[must_use]
    pub fn role(&self) -> Role {
        Role::detect(self.manifest.as_deref())
    }

    /// Overrides the process notified once a successor is ready.
    #[must_use]
    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = parent;
        self
    }

    /// Overrides the source of inherited descriptors.
    #[must_use]
    pub fn with_fds(mut self, fds: Box<dyn InheritedFds>) -> Self {
        self.fds = Some(fds);
        self
    }

    /// Overrides how successors are spawned.
    #[must_use]
    pub fn with_spawner(mut self, spawner: Box<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Brings the process up and serves until shutdown.
    ///
    /// # Errors
    /// Any error from bring-up or from the quit callback; see
    /// [`MoltError::exit_code`] for how each maps to an exit status.
    pub async fn run<S: Service + ?Sized>(
        self,
        service: &mut S,
        signals: &mut SignalContext,
    ) -> Result<ShutdownReport> {
        self.config.validate()?;
        let role = self.role();
        tracing::info!(?role, pid = std::process::id(), "starting");

        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => Box::new(ProcessSpawner::new(ProcessImage::current(
                &self.config.manifest_var,
            )?)),
        };

        let registry = match (role, self.manifest) {
            (Role::Successor, Some(manifest)) => {
                let mut fds = match self.fds {
                    Some(fds) => fds,
                    None => Box::new(ProcessFds::claim().ok_or_else(|| {
                        MoltError::state("inherited descriptors already claimed")
                    })?),
                };
                bring_up(&manifest, fds.as_mut(), &self.parent, service).await?
            }
            _ => {
                let mut registry = Registry::new();
                service
                    .init_parent(&mut registry)
                    .await
                    .map_err(|source| MoltError::callback(CallbackPhase::InitParent, source))?;
                registry
            }
        };
        tracing::info!(resources = registry.len(), "ready");

        let mut predecessor = Predecessor::new(registry, spawner, self.config);
        predecessor.serve(signals, service).await
    }
}

/// Runs `service` for the lifetime of this process.
///
/// Installs the signal handlers, detects the role from the manifest
/// variable in `config`, and serves until shutdown. Returns only after a
/// clean shutdown or a failed `quit`; bring-up failures exit the process
/// with the status listed in the module docs.
pub async fn start<S: Service>(config: RestartConfig, mut service: S) {
    let mut signals = match SignalContext::install() {
        Ok(signals) => signals,
        Err(err) => exit_with(&err),
    };

    match Launcher::from_env(config)
        .run(&mut service, &mut signals)
        .await
    {
        Ok(report) => tracing::info!(
            trigger = ?report.trigger,
            restarts = report.restarts_attempted,
            "shutdown complete"
        ),
        Err(err) if err.exit_code() == 0 => {
            tracing::error!(error = %err, "shutdown completed with errors");
        }
        Err(err) => exit_with(&err),
    }
}

fn exit_with(err: &MoltError) -> ! {
    let code = err.exit_code();
    tracing::error!(error = %err, code, "exiting");
    std::process::exit(code)
}
