//! Deadline handed to the quit callback.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default time the quit callback gets to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shutdown deadline shared with the quit callback.
///
/// The token is cancelled when the deadline passes, or earlier once the
/// restart loop has finished with the callback.
#[derive(Debug, Clone)]
pub struct ShutdownContext {
    timeout: Duration,
    deadline: Instant,
    token: CancellationToken,
}

impl ShutdownContext {
    /// Creates a context whose deadline is `timeout` from now.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let token = CancellationToken::new();

        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    tracing::debug!("shutdown deadline reached");
                    timer.cancel();
                }
                () = timer.cancelled() => {}
            }
        });

        Self {
            timeout,
            deadline,
            token,
        }
    }

    /// Total drain budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns true once the deadline passed or the drain was abandoned.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Token cancelled at the deadline.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Waits until the deadline expires.
    pub async fn expired(&self) {
        self.token.cancelled().await;
    }

    /// Runs `fut` until it completes or the deadline expires.
    ///
    /// Returns `None` if the deadline won.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            out = fut => Some(out),
            () = self.token.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = ShutdownContext::new(Duration::from_secs(5));
        assert_eq!(ctx.timeout(), Duration::from_secs(5));
        assert!(!ctx.is_expired());

        tokio::time::advance(Duration::from_secs(6)).await;
        ctx.expired().await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_before_deadline() {
        let ctx = ShutdownContext::new(Duration::from_secs(5));
        let out = ctx.run(async { 42 }).await;
        assert_eq!(out, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cut_off_at_deadline() {
        let ctx = ShutdownContext::new(Duration::from_secs(1));
        let out = ctx
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_clone_shares_token() {
        let ctx = ShutdownContext::new(Duration::from_secs(60));
        let clone = ctx.clone();
        ctx.token().cancel();
        assert!(clone.is_expired());
    }
}
