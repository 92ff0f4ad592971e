//! End-to-end restart tests against the molt-probe binary.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use molt_core::Signal;
use molt_test::RestartHarness;

const PROBE: &str = env!("CARGO_BIN_EXE_molt-probe");
const STEP: Duration = Duration::from_secs(10);

#[tokio::test]
async fn fresh_probe_serves_its_pid() {
    let mut harness = RestartHarness::spawn(PROBE).await.unwrap();
    let (port, pid) = harness.listening(STEP).await.unwrap();
    assert_eq!(harness.first_pid(), Some(pid));
    assert_eq!(harness.fetch_pid(port).await.unwrap(), pid);

    harness.signal(pid, Signal::Int).unwrap();
    harness.quit(pid, STEP).await.unwrap();
    let status = harness.wait_first(STEP).await.unwrap();
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn hangup_hands_listener_to_successor() {
    let mut harness = RestartHarness::spawn(PROBE).await.unwrap();
    let (port, first) = harness.listening(STEP).await.unwrap();

    harness.signal(first, Signal::Hup).unwrap();
    let second = harness.ready(STEP).await.unwrap();
    assert_ne!(second, first);

    harness.quit(first, STEP).await.unwrap();
    let status = harness.wait_first(STEP).await.unwrap();
    assert_eq!(status.code(), Some(0));
    assert_eq!(harness.fetch_pid(port).await.unwrap(), second);

    // The successor can hand over again.
    harness.signal(second, Signal::Hup).unwrap();
    let third = harness.ready(STEP).await.unwrap();
    harness.quit(second, STEP).await.unwrap();
    assert_eq!(harness.fetch_pid(port).await.unwrap(), third);

    harness.signal(third, Signal::Term).unwrap();
    harness.quit(third, STEP).await.unwrap();
}

#[tokio::test]
async fn no_connection_refused_during_handoff() {
    let mut harness = RestartHarness::spawn(PROBE).await.unwrap();
    let (port, first) = harness.listening(STEP).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let served = Arc::new(AtomicU32::new(0));
    let client = {
        let stop = Arc::clone(&stop);
        let served = Arc::clone(&served);
        tokio::spawn(async move {
            let mut failures = Vec::new();
            while !stop.load(Ordering::SeqCst) {
                let attempt = async {
                    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
                    let mut reply = String::new();
                    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut reply).await?;
                    Ok::<_, std::io::Error>(reply)
                };
                match attempt.await {
                    Ok(_) => {
                        served.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => failures.push(err.to_string()),
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            failures
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.signal(first, Signal::Hup).unwrap();
    let second = harness.ready(STEP).await.unwrap();
    harness.quit(first, STEP).await.unwrap();
    harness.wait_first(STEP).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    stop.store(true, Ordering::SeqCst);
    let failures = client.await.unwrap();
    assert!(failures.is_empty(), "failed connections: {failures:?}");
    assert!(served.load(Ordering::SeqCst) > 0);

    harness.signal(second, Signal::Int).unwrap();
    harness.quit(second, STEP).await.unwrap();
}
