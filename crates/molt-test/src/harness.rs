//! Restart test harness.
//!
//! Drives a probe binary through restarts. Every generation shares the
//! first process's stdout, so events from predecessor and successors arrive
//! on one pipe in the order they were printed.

use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;

use molt_core::{DEFAULT_MANIFEST_VAR, Signal};
use nix::sys::signal::{Signal as NixSignal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};

use crate::error::{Result, TestError};

/// Address key the probe registers its listener under.
pub const PROBE_ADDRESS: &str = ":9090";

/// One lifecycle line printed by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    /// A fresh probe is accepting on `port`.
    Listening {
        /// Bound TCP port.
        port: u16,
        /// Probe pid.
        pid: u32,
    },
    /// A successor finished `init_child`.
    Ready {
        /// Successor pid.
        pid: u32,
    },
    /// A probe finished `quit`.
    Quit {
        /// Pid of the exiting probe.
        pid: u32,
    },
}

impl ProbeEvent {
    /// Pid of the process that printed the event.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        match self {
            Self::Listening { pid, .. } | Self::Ready { pid } | Self::Quit { pid } => *pid,
        }
    }
}

impl fmt::Display for ProbeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { port, pid } => write!(f, "LISTENING {port} {pid}"),
            Self::Ready { pid } => write!(f, "READY {pid}"),
            Self::Quit { pid } => write!(f, "QUIT {pid}"),
        }
    }
}

impl FromStr for ProbeEvent {
    type Err = TestError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let number = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| TestError::protocol(line.to_string()))
        };
        match parts.as_slice() {
            ["LISTENING", port, pid] => Ok(Self::Listening {
                port: port
                    .parse()
                    .map_err(|_| TestError::protocol(line.to_string()))?,
                pid: number(pid)?,
            }),
            ["READY", pid] => Ok(Self::Ready { pid: number(pid)? }),
            ["QUIT", pid] => Ok(Self::Quit { pid: number(pid)? }),
            _ => Err(TestError::protocol(line.to_string())),
        }
    }
}

/// A probe under test, with every generation it spawned.
pub struct RestartHarness {
    child: Child,
    events: Lines<BufReader<ChildStdout>>,
    seen: Vec<u32>,
}

impl RestartHarness {
    /// Starts `binary` as a fresh predecessor.
    ///
    /// # Errors
    /// Returns an error if the binary cannot be started.
    pub async fn spawn(binary: impl AsRef<Path>) -> Result<Self> {
        let mut child = Command::new(binary.as_ref())
            .env_remove(DEFAULT_MANIFEST_VAR)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TestError::harness("probe stdout not captured"))?;
        let seen = child.id().into_iter().collect();

        Ok(Self {
            child,
            events: BufReader::new(stdout).lines(),
            seen,
        })
    }

    /// Pid of the first process.
    #[must_use]
    pub fn first_pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reads the next event.
    ///
    /// # Errors
    /// Returns `Timeout` if nothing arrives in time, or an error if the pipe
    /// closed or the line is not an event.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<ProbeEvent> {
        let line = tokio::time::timeout(timeout, self.events.next_line())
            .await
            .map_err(|_| TestError::Timeout(timeout))??
            .ok_or_else(|| TestError::harness("probe output closed"))?;
        let event: ProbeEvent = line.parse()?;
        match event {
            ProbeEvent::Quit { pid } => self.seen.retain(|&p| p != pid),
            _ if !self.seen.contains(&event.pid()) => self.seen.push(event.pid()),
            _ => {}
        }
        tracing::debug!(%event, "probe event");
        Ok(event)
    }

    /// Waits for a fresh probe to report its port; returns `(port, pid)`.
    ///
    /// # Errors
    /// Returns an error if another event arrives first or on timeout.
    pub async fn listening(&mut self, timeout: Duration) -> Result<(u16, u32)> {
        match self.next_event(timeout).await? {
            ProbeEvent::Listening { port, pid } => Ok((port, pid)),
            other => Err(TestError::protocol(format!("expected LISTENING, got {other}"))),
        }
    }

    /// Waits for a successor to report ready; returns its pid.
    ///
    /// # Errors
    /// Returns an error if another event arrives first or on timeout.
    pub async fn ready(&mut self, timeout: Duration) -> Result<u32> {
        match self.next_event(timeout).await? {
            ProbeEvent::Ready { pid } => Ok(pid),
            other => Err(TestError::protocol(format!("expected READY, got {other}"))),
        }
    }

    /// Waits for the probe `pid` to report that it drained.
    ///
    /// # Errors
    /// Returns an error if another event arrives first or on timeout.
    pub async fn quit(&mut self, pid: u32, timeout: Duration) -> Result<()> {
        match self.next_event(timeout).await? {
            ProbeEvent::Quit { pid: quit } if quit == pid => Ok(()),
            other => Err(TestError::protocol(format!("expected QUIT {pid}, got {other}"))),
        }
    }

    /// Sends `signal` to `pid`.
    ///
    /// # Errors
    /// Returns an error if the signal cannot be delivered.
    pub fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let sig = NixSignal::try_from(signal.as_i32())
            .map_err(|e| TestError::harness(format!("unknown signal {signal:?}: {e}")))?;
        kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| TestError::harness(format!("cannot signal {pid}: {e}")))
    }

    /// Waits for the first process to exit.
    ///
    /// # Errors
    /// Returns `Timeout` if it is still running after `timeout`.
    pub async fn wait_first(&mut self, timeout: Duration) -> Result<ExitStatus> {
        let first = self.child.id();
        let status = tokio::time::timeout(timeout, self.child.wait())
            .await
            .map_err(|_| TestError::Timeout(timeout))??;
        self.seen.retain(|&p| Some(p) != first);
        Ok(status)
    }

    /// Connects to `port` and returns the pid the serving probe answers with.
    ///
    /// # Errors
    /// Returns an error if the connection is refused or the reply is not a pid.
    pub async fn fetch_pid(&self, port: u16) -> Result<u32> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        reply
            .trim()
            .parse()
            .map_err(|_| TestError::protocol(format!("bad pid reply {reply:?}")))
    }
}

impl Drop for RestartHarness {
    fn drop(&mut self) {
        // Successors are not our children; kill_on_drop only covers the first.
        // Probes that reported QUIT were dropped from `seen` already.
        for &pid in &self.seen {
            let _ = kill(Pid::from_raw(pid as i32), NixSignal::SIGKILL);
        }
    }
}
