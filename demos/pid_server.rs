// Examples are allowed to use expect/unwrap for simplicity
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Molt PID Server Example
//!
//! An HTTP server that answers every request with the pid of the process
//! serving it. Send SIGHUP to swap in a fresh process without refusing a
//! single connection; the old process drains in-flight requests and exits.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example pid_server
//!
//! curl http://127.0.0.1:3030/      # -> 12345
//! kill -HUP 12345
//! curl http://127.0.0.1:3030/      # -> 12399
//!
//! # Keep an access log open across restarts
//! MOLT_DEMO_LOG=/tmp/pid_server.log cargo run --example pid_server
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use molt::prelude::*;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const ADDR: &str = ":3030";
const BIND: &str = "0.0.0.0:3030";
const LOG_VAR: &str = "MOLT_DEMO_LOG";

#[derive(Default)]
struct PidServer {
    token: CancellationToken,
    tracker: TaskTracker,
    log: Option<Arc<Mutex<File>>>,
}

impl PidServer {
    fn serve(&mut self, listener: TcpListener) {
        let token = self.token.clone();
        let tracker = self.tracker.clone();
        let log = self.log.clone();
        self.tracker.spawn(async move {
            loop {
                let (mut stream, peer) = tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    },
                };
                let log = log.clone();
                tracker.spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = stream.read(&mut request).await;
                    let body = format!("{}\n", std::process::id());
                    let response = format!(
                        "HTTP/1.1 200 OK\r\n\
                         content-type: text/plain\r\n\
                         content-length: {}\r\n\
                         connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    if let Some(log) = log {
                        let _ = writeln!(log.lock(), "{} {peer}", std::process::id());
                    }
                });
            }
        });
    }
}

#[async_trait]
impl Service for PidServer {
    async fn init_parent(&mut self, registry: &mut Registry) -> Result<(), CallbackError> {
        let listener = TcpListener::bind(BIND).await?;
        registry.register_listener(&listener, ADDR)?;

        if let Ok(path) = std::env::var(LOG_VAR) {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            registry.register_file(&file, &path)?;
            self.log = Some(Arc::new(Mutex::new(file)));
        }

        println!("[INIT] pid {} listening on {BIND}", std::process::id());
        self.serve(listener);
        Ok(())
    }

    async fn init_child(
        &mut self,
        inherited: &mut Inheritance,
        registry: &mut Registry,
    ) -> Result<(), CallbackError> {
        let listener = inherited
            .take_tcp_listener(ADDR)
            .ok_or_else(|| format!("inherit {ADDR} not found"))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        registry.register_listener(&listener, ADDR)?;

        if let Ok(path) = std::env::var(LOG_VAR) {
            if let Some(file) = inherited.take_file(&path) {
                registry.register_file(&file, &path)?;
                self.log = Some(Arc::new(Mutex::new(file)));
            }
        }

        println!("[INIT] pid {} took over {ADDR}", std::process::id());
        self.serve(listener);
        Ok(())
    }

    async fn quit(&mut self, ctx: ShutdownContext) -> Result<(), CallbackError> {
        self.token.cancel();
        self.tracker.close();
        if ctx.run(self.tracker.wait()).await.is_none() {
            return Err("requests still in flight at deadline".into());
        }
        println!("[QUIT] pid {}", std::process::id());
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    start(RestartConfig::default(), PidServer::default()).await;
}
