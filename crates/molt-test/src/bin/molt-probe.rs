//! Probe server for restart tests.
//!
//! Answers every TCP connection with its own pid and reports lifecycle
//! events on stdout, one per line:
//!
//! ```text
//! LISTENING <port> <pid>
//! READY <pid>
//! QUIT <pid>
//! ```
//!
//! Logs go to stderr. A successor inherits stdout, so a harness reading the
//! pipe sees the events of every generation.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p molt-test --bin molt-probe
//! kill -HUP <pid>   # hand over to a fresh process
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use molt_core::{CallbackError, Inheritance, Registry, RestartConfig, Service, ShutdownContext};
use molt_test::{PROBE_ADDRESS, ProbeEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Environment variable overriding the bind address of a fresh probe.
const BIND_VAR: &str = "MOLT_PROBE_BIND";

#[derive(Default)]
struct Probe {
    token: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl Probe {
    fn serve(&mut self, listener: TcpListener) {
        let token = self.token.clone();
        self.server = Some(tokio::spawn(accept_loop(listener, token)));
    }
}

async fn accept_loop(listener: TcpListener, token: CancellationToken) {
    let pid = std::process::id();
    loop {
        let accepted = tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((mut stream, peer)) => {
                tokio::spawn(async move {
                    if let Err(err) = stream.write_all(format!("{pid}\n").as_bytes()).await {
                        tracing::debug!(%peer, error = %err, "client went away");
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(err) => tracing::warn!(error = %err, "accept failed"),
        }
    }
}

fn register(registry: &mut Registry, listener: &TcpListener) -> Result<(), CallbackError> {
    registry.register_listener(listener, PROBE_ADDRESS)?;
    Ok(())
}

#[async_trait]
impl Service for Probe {
    async fn init_parent(&mut self, registry: &mut Registry) -> Result<(), CallbackError> {
        let bind: SocketAddr = std::env::var(BIND_VAR)
            .unwrap_or_else(|_| "127.0.0.1:0".to_string())
            .parse()?;
        let listener = TcpListener::bind(bind).await?;
        let port = listener.local_addr()?.port();
        register(registry, &listener)?;
        self.serve(listener);

        println!(
            "{}",
            ProbeEvent::Listening {
                port,
                pid: std::process::id()
            }
        );
        Ok(())
    }

    async fn init_child(
        &mut self,
        inherited: &mut Inheritance,
        registry: &mut Registry,
    ) -> Result<(), CallbackError> {
        let std_listener = inherited
            .take_tcp_listener(PROBE_ADDRESS)
            .ok_or_else(|| format!("no listener inherited for {PROBE_ADDRESS}"))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        register(registry, &listener)?;
        self.serve(listener);

        println!("{}", ProbeEvent::Ready { pid: std::process::id() });
        Ok(())
    }

    async fn quit(&mut self, ctx: ShutdownContext) -> Result<(), CallbackError> {
        self.token.cancel();
        if let Some(server) = self.server.take() {
            if ctx.run(server).await.is_none() {
                tracing::warn!("accept loop still running at deadline");
            }
        }
        println!("{}", ProbeEvent::Quit { pid: std::process::id() });
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    molt_core::start(RestartConfig::default(), Probe::default()).await;
}
