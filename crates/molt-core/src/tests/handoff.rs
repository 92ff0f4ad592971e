//! Handoff tests driven in-process.
//!
//! The predecessor and successor run in the same test process; the mock
//! spawner captures the descriptors the real spawner would have placed at
//! slots 3 and up, and the successor binds them from a [`SlotMap`].

use std::net::{TcpListener, TcpStream};
use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use crate::config::RestartConfig;
use crate::error::MoltError;
use crate::launcher::Launcher;
use crate::predecessor::Predecessor;
use crate::record::Registry;
use crate::signal::SignalContext;
use crate::successor::ParentLink;
use crate::tests::mocks::{MockService, MockSpawner, SlotMap};
use crate::types::{Role, RoleState, Signal};

fn config() -> RestartConfig {
    RestartConfig::new().with_notify_parent(false)
}

/// A failed spawn leaves the predecessor serving; only a later shutdown
/// signal runs quit.
#[tokio::test]
async fn failed_restart_keeps_serving_until_shutdown() {
    let spawner = MockSpawner::new().failing("exec format error");
    let mut pred = Predecessor::new(Registry::new(), Box::new(spawner.clone()), config());
    let (mut signals, handle) = SignalContext::new();
    let mut service = MockService::new();
    let observer = service.clone();

    handle.send(Signal::Hup).await.unwrap();
    handle.send(Signal::Hup).await.unwrap();

    let serve = pred.serve(&mut signals, &mut service);
    tokio::pin!(serve);
    let early = tokio::time::timeout(Duration::from_millis(100), &mut serve).await;
    assert!(early.is_err(), "serve ended without a shutdown signal");
    assert_eq!(observer.quit_count(), 0);
    assert_eq!(spawner.attempts(), 2);

    handle.send(Signal::Int).await.unwrap();
    let report = serve.await.unwrap();
    assert_eq!(report.restarts_attempted, 2);
    assert!(report.successors.is_empty());
    assert_eq!(observer.quit_count(), 1);
}

/// Repeated shutdown signals still run quit exactly once, with the default
/// drain budget, and nothing queued after them is acted on.
#[tokio::test]
async fn repeated_shutdown_runs_quit_once() {
    let spawner = MockSpawner::new();
    let mut pred = Predecessor::new(
        Registry::new(),
        Box::new(spawner.clone()),
        RestartConfig::new(),
    );
    let (mut signals, handle) = SignalContext::new();
    let mut service = MockService::new();

    handle.send(Signal::Int).await.unwrap();
    handle.send(Signal::Int).await.unwrap();
    handle.send(Signal::Hup).await.unwrap();

    let report = pred.serve(&mut signals, &mut service).await.unwrap();
    assert_eq!(report.trigger, Some(Signal::Int));
    assert_eq!(service.quit_count(), 1);
    assert_eq!(service.last_timeout(), Some(Duration::from_secs(5)));
    assert_eq!(spawner.attempts(), 0);
    assert_eq!(pred.state(), RoleState::Terminated);

    let again = pred.serve(&mut signals, &mut service).await;
    assert!(matches!(again, Err(MoltError::State(_))));
    assert_eq!(service.quit_count(), 1);
    assert_eq!(spawner.attempts(), 0);
}

/// One process runs exactly one of the two init callbacks.
#[tokio::test]
async fn role_selects_one_init_callback() {
    for (manifest, role) in [(None, Role::Predecessor), (Some("[]"), Role::Successor)] {
        let launcher = Launcher::new(config(), manifest.map(str::to_string))
            .with_spawner(Box::new(MockSpawner::new()))
            .with_fds(Box::new(SlotMap::new()));
        assert_eq!(launcher.role(), role);

        let (mut signals, handle) = SignalContext::new();
        let mut service = MockService::new();
        handle.send(Signal::Term).await.unwrap();
        launcher.run(&mut service, &mut signals).await.unwrap();

        assert_eq!(
            service.init_parent_count() + service.init_child_count(),
            1,
            "{role:?}"
        );
        assert_eq!(service.init_child_count() == 1, role == Role::Successor);
    }
}

/// A ready successor interrupts its parent; the parent is what exits.
#[tokio::test]
async fn ready_successor_interrupts_parent() {
    let mut parent = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let launcher = Launcher::new(RestartConfig::new(), Some("[]".to_string()))
        .with_parent(ParentLink::new(parent.id()))
        .with_spawner(Box::new(MockSpawner::new()))
        .with_fds(Box::new(SlotMap::new()));
    let (mut signals, handle) = SignalContext::new();
    let mut service = MockService::new();
    handle.send(Signal::Int).await.unwrap();

    launcher.run(&mut service, &mut signals).await.unwrap();
    let status = parent.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGINT));
}

/// The listener registered by the predecessor reaches the successor at
/// slot 3 under the same address, and keeps serving the same port.
#[tokio::test]
async fn listener_survives_handoff() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut registry = Registry::new();
    registry.register_listener(&listener, ":9090").unwrap();
    drop(listener);

    let spawner = MockSpawner::new();
    let mut pred = Predecessor::new(registry, Box::new(spawner.clone()), config());
    pred.restart().unwrap();
    assert_eq!(spawner.last_slots(), vec![3]);

    let manifest = spawner.last_manifest().unwrap();
    let child_fds = spawner.take_child_fds();
    let mut service = MockService::new().adopt_listener(":9090");
    let (mut signals, handle) = SignalContext::new();
    let child_spawner = MockSpawner::new();
    let successor = Launcher::new(config(), Some(manifest))
        .with_spawner(Box::new(child_spawner.clone()))
        .with_fds(Box::new(child_fds));

    handle.send(Signal::Hup).await.unwrap();
    handle.send(Signal::Int).await.unwrap();
    successor.run(&mut service, &mut signals).await.unwrap();

    assert_eq!(service.adopted(), vec![addr]);
    // The successor passes the adopted listener on under the same key.
    assert!(child_spawner.last_manifest().unwrap().contains(r#""addr":":9090""#));

    // The predecessor's copy is still listening on the original port.
    assert!(TcpStream::connect(addr).is_ok());
    assert_eq!(pred.state(), RoleState::Serving);
}
