//! Caller-supplied lifecycle callbacks.

use async_trait::async_trait;

use crate::error::CallbackError;
use crate::inherit::Inheritance;
use crate::record::Registry;
use crate::shutdown::ShutdownContext;

/// A server taking part in the restart handoff.
///
/// Exactly one of [`init_parent`](Self::init_parent) and
/// [`init_child`](Self::init_child) runs per process, followed by at most
/// one [`quit`](Self::quit).
///
/// # Example
///
/// ```rust,ignore
/// use molt_core::{CallbackError, Inheritance, Registry, Service, ShutdownContext};
///
/// struct Echo {
///     listener: Option<tokio::net::TcpListener>,
/// }
///
/// #[async_trait::async_trait]
/// impl Service for Echo {
///     async fn init_parent(&mut self, registry: &mut Registry) -> Result<(), CallbackError> {
///         let listener = tokio::net::TcpListener::bind("0.0.0.0:9090").await?;
///         registry.register_listener(&listener, ":9090")?;
///         self.listener = Some(listener);
///         Ok(())
///     }
///
///     async fn init_child(
///         &mut self,
///         inherited: &mut Inheritance,
///         registry: &mut Registry,
///     ) -> Result<(), CallbackError> {
///         let std = inherited.take_tcp_listener(":9090").ok_or("no listener for :9090")?;
///         std.set_nonblocking(true)?;
///         let listener = tokio::net::TcpListener::from_std(std)?;
///         registry.register_listener(&listener, ":9090")?;
///         self.listener = Some(listener);
///         Ok(())
///     }
///
///     async fn quit(&mut self, ctx: ShutdownContext) -> Result<(), CallbackError> {
///         self.listener.take();
///         ctx.expired().await;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Service: Send + 'static {
    /// Sets up a fresh process: bind listeners, open files, and register
    /// each one that a successor should inherit.
    ///
    /// # Errors
    /// An error aborts start-up with exit status 1.
    async fn init_parent(&mut self, registry: &mut Registry) -> Result<(), CallbackError>;

    /// Sets up a successor from what it inherited.
    ///
    /// Resources left in `inherited` are closed once this returns. Whatever
    /// is registered in `registry` is handed to the next successor.
    ///
    /// # Errors
    /// An error aborts start-up with exit status 3; the parent keeps serving.
    async fn init_child(
        &mut self,
        inherited: &mut Inheritance,
        registry: &mut Registry,
    ) -> Result<(), CallbackError>;

    /// Drains in-flight work and stops serving.
    ///
    /// `ctx` carries the drain deadline; its token is cancelled once the
    /// deadline passes.
    ///
    /// # Errors
    /// An error is logged; the process still exits with status 0.
    async fn quit(&mut self, ctx: ShutdownContext) -> Result<(), CallbackError>;
}
