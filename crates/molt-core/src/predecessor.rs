//! The serving side of the handoff.
//!
//! A predecessor serves until told to stop. SIGHUP spawns a successor that
//! inherits every registered resource; the predecessor keeps serving
//! regardless of how the spawn went. SIGINT, SIGQUIT or SIGTERM run the
//! quit callback once and end the loop. A successor that is ready sends
//! SIGINT to its parent, which is what retires the old process.

use crate::config::RestartConfig;
use crate::error::{CallbackPhase, MoltError, Result};
use crate::record::Registry;
use crate::service::Service;
use crate::shutdown::ShutdownContext;
use crate::signal::SignalContext;
use crate::spawn::{ChildFdTable, SpawnRequest, Spawner};
use crate::types::{RoleState, Signal, SignalClass};

/// Outcome of one serve loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Signal that ended the loop; `None` if the signal source closed.
    pub trigger: Option<Signal>,
    /// Number of restart signals handled.
    pub restarts_attempted: u32,
    /// Pids of successors spawned, in order.
    pub successors: Vec<u32>,
    /// Registered resources released after quit.
    pub released: usize,
}

/// Serving process with its registered resources.
pub struct Predecessor {
    registry: Registry,
    spawner: Box<dyn Spawner>,
    config: RestartConfig,
    state: RoleState,
    restarts_attempted: u32,
    successors: Vec<u32>,
}

impl std::fmt::Debug for Predecessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predecessor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("restarts_attempted", &self.restarts_attempted)
            .field("successors", &self.successors)
            .finish_non_exhaustive()
    }
}

impl Predecessor {
    /// Creates a serving predecessor.
    #[must_use]
    pub fn new(registry: Registry, spawner: Box<dyn Spawner>, config: RestartConfig) -> Self {
        Self {
            registry,
            spawner,
            config,
            state: RoleState::Serving,
            restarts_attempted: 0,
            successors: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RoleState {
        self.state
    }

    /// Resources handed to each successor.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mutable access to the registry, for resources opened while serving.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Pids of successors spawned so far.
    #[must_use]
    pub fn successors(&self) -> &[u32] {
        &self.successors
    }

    /// Spawns one successor with the current registry.
    ///
    /// # Errors
    /// Returns the encode, duplication or spawn error. The registry and the
    /// serving state are unaffected either way.
    pub fn restart(&mut self) -> Result<u32> {
        self.restarts_attempted += 1;

        let manifest = self.registry.manifest().encode()?;
        let fds = ChildFdTable::build(&self.registry)?;
        let request = SpawnRequest {
            manifest_var: self.config.manifest_var.clone(),
            manifest,
            fds,
        };

        let pid = self.spawner.spawn(request)?;
        self.successors.push(pid);
        tracing::info!(
            pid,
            resources = self.registry.len(),
            "spawned successor"
        );
        Ok(pid)
    }

    /// Serves until a shutdown signal, then runs `quit` once.
    ///
    /// # Errors
    /// Returns `State` if the loop already finished, or the quit callback's
    /// error wrapped as `Callback { phase: Quit, .. }`.
    pub async fn serve<S: Service + ?Sized>(
        &mut self,
        signals: &mut SignalContext,
        service: &mut S,
    ) -> Result<ShutdownReport> {
        match self.state {
            RoleState::Serving => {}
            state if state.is_terminal() => {
                return Err(MoltError::state("serve loop already finished"));
            }
            state => {
                return Err(MoltError::state(format!("cannot serve in state {state:?}")));
            }
        }

        tracing::info!(pid = std::process::id(), "serving");

        let trigger = loop {
            let Some(sig) = signals.recv().await else {
                tracing::warn!("signal source closed, shutting down");
                break None;
            };

            match sig.class() {
                SignalClass::Restart => {
                    tracing::info!(signal = ?sig, "restart requested");
                    if let Err(err) = self.restart() {
                        tracing::error!(error = %err, "unable to spawn successor");
                    }
                }
                SignalClass::Shutdown => {
                    tracing::info!(signal = ?sig, "shutdown requested");
                    break Some(sig);
                }
            }
        };

        self.state = RoleState::Draining;
        let ctx = ShutdownContext::new(self.config.shutdown_timeout);
        let outcome = {
            let _guard = ctx.token().clone().drop_guard();
            service.quit(ctx).await
        };

        let released = self.registry.close_all();
        self.state = RoleState::Terminated;

        let report = ShutdownReport {
            trigger,
            restarts_attempted: self.restarts_attempted,
            successors: self.successors.clone(),
            released,
        };

        match outcome {
            Ok(()) => {
                tracing::info!(released, "drained");
                Ok(report)
            }
            Err(source) => Err(MoltError::callback(CallbackPhase::Quit, source)),
        }
    }
}
