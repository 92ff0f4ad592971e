//! Signal delivery into the restart loop.
//!
//! OS signals are forwarded into a bounded channel and consumed one at a
//! time, in delivery order. Tests feed the same channel through a
//! [`SignalHandle`] instead of raising real signals.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MoltError, Result};
use crate::types::Signal;

/// Capacity of the signal queue.
const SIGNAL_QUEUE: usize = 64;

/// Receiving side of the signal queue.
#[derive(Debug)]
pub struct SignalContext {
    signal_rx: mpsc::Receiver<Signal>,
    forwarder: Option<JoinHandle<()>>,
}

impl SignalContext {
    /// Creates a context fed only through the returned handle.
    #[must_use]
    pub fn new() -> (Self, SignalHandle) {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
        let ctx = Self {
            signal_rx,
            forwarder: None,
        };
        (ctx, SignalHandle { signal_tx })
    }

    /// Installs handlers for SIGHUP, SIGINT, SIGQUIT and SIGTERM and
    /// forwards them into a new context.
    ///
    /// Must be called from within a tokio runtime. Once installed, these
    /// signals no longer terminate the process by default.
    ///
    /// # Errors
    /// Returns `Signal` if a handler cannot be registered.
    pub fn install() -> Result<Self> {
        let (mut ctx, handle) = Self::new();

        let mut hup = listen(SignalKind::hangup(), "SIGHUP")?;
        let mut int = listen(SignalKind::interrupt(), "SIGINT")?;
        let mut quit = listen(SignalKind::quit(), "SIGQUIT")?;
        let mut term = listen(SignalKind::terminate(), "SIGTERM")?;

        let forwarder = tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    Some(()) = hup.recv() => Signal::Hup,
                    Some(()) = int.recv() => Signal::Int,
                    Some(()) = quit.recv() => Signal::Quit,
                    Some(()) = term.recv() => Signal::Term,
                    else => break,
                };
                tracing::debug!(signal = ?sig, "forwarding OS signal");
                if handle.send(sig).await.is_err() {
                    break;
                }
            }
        });

        ctx.forwarder = Some(forwarder);
        Ok(ctx)
    }

    /// Waits for the next signal. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.signal_rx.recv().await
    }

    /// Returns the next queued signal, if any.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.signal_rx.try_recv().ok()
    }

    /// Returns true if OS signals are forwarded into this context.
    #[must_use]
    pub const fn is_installed(&self) -> bool {
        self.forwarder.is_some()
    }
}

impl Drop for SignalContext {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

fn listen(kind: SignalKind, name: &str) -> Result<tokio::signal::unix::Signal> {
    signal(kind).map_err(|e| MoltError::signal(format!("cannot install {name} handler: {e}")))
}

/// Handle for queueing signals into a [`SignalContext`].
#[derive(Clone, Debug)]
pub struct SignalHandle {
    signal_tx: mpsc::Sender<Signal>,
}

impl SignalHandle {
    /// Queues a signal.
    ///
    /// # Errors
    /// Returns an error if the context was dropped.
    pub async fn send(&self, signal: Signal) -> Result<()> {
        self.signal_tx
            .send(signal)
            .await
            .map_err(|_| MoltError::signal("signal context closed"))
    }

    /// Queues a signal without waiting for queue space.
    ///
    /// # Errors
    /// Returns an error if the queue is full or the context was dropped.
    pub fn try_send(&self, signal: Signal) -> Result<()> {
        self.signal_tx
            .try_send(signal)
            .map_err(|e| MoltError::signal(format!("cannot queue {signal:?}: {e}")))
    }

    /// Requests a restart.
    ///
    /// # Errors
    /// Returns an error if the context was dropped.
    pub async fn restart(&self) -> Result<()> {
        self.send(Signal::Hup).await
    }

    /// Requests shutdown.
    ///
    /// # Errors
    /// Returns an error if the context was dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Signal::Int).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signals_delivered_in_order() {
        let (mut ctx, handle) = SignalContext::new();
        handle.send(Signal::Hup).await.unwrap();
        handle.send(Signal::Quit).await.unwrap();
        handle.send(Signal::Int).await.unwrap();

        assert_eq!(ctx.recv().await, Some(Signal::Hup));
        assert_eq!(ctx.recv().await, Some(Signal::Quit));
        assert_eq!(ctx.try_recv(), Some(Signal::Int));
        assert_eq!(ctx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_none_after_handles_dropped() {
        let (mut ctx, handle) = SignalContext::new();
        drop(handle);
        assert_eq!(ctx.recv().await, None);
        assert!(!ctx.is_installed());
    }

    #[tokio::test]
    async fn test_send_after_context_dropped() {
        let (ctx, handle) = SignalContext::new();
        drop(ctx);
        assert!(handle.send(Signal::Term).await.is_err());
        assert!(handle.try_send(Signal::Term).is_err());
    }

    #[tokio::test]
    async fn test_recv_async() {
        let (mut ctx, handle) = SignalContext::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.restart().await.ok();
        });
        assert_eq!(ctx.recv().await, Some(Signal::Hup));
    }

    #[tokio::test]
    async fn test_install_forwards_os_signal() {
        let mut ctx = SignalContext::install().unwrap();
        assert!(ctx.is_installed());

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();
        let sig = tokio::time::timeout(Duration::from_secs(5), ctx.recv()).await;
        assert_eq!(sig.unwrap(), Some(Signal::Hup));
    }
}
