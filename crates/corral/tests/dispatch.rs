//! Session and dispatcher behavior over an in-memory transport.
//!
//! These tests drive `run_session` with plain channels standing in for the
//! stream halves: inbound messages go through an mpsc sender, outbound
//! messages surface on the shared queue a real ROUTER loop would drain.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corral::correlation::CorrelationTable;
use corral::session::{run_session, PeerId, SendHandle, SessionConfig, SessionContext, SessionError};
use corral::store::{spawn_store_writer, HostStore, StoreHandle};
use corral::{DispatchError, Dispatcher, HostRegistry, HostStatus};
use corralproto::{
    ControlEnvelope, ControlPayload, HostEnvelope, HostPayload, HostRegistration,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct NullStore;

impl HostStore for NullStore {
    fn upsert_host(&self, _registration: &HostRegistration) -> anyhow::Result<()> {
        Ok(())
    }

    fn record_heartbeat(
        &self,
        _host_id: &str,
        _available_cpus: u32,
        _available_memory_mb: u64,
        _available_disk_mb: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

fn registration(host_id: &str, images: &[&str]) -> HostRegistration {
    HostRegistration {
        host_id: host_id.to_string(),
        hostname: format!("{host_id}.example"),
        version: "0.1.0".to_string(),
        total_cpus: 16,
        total_memory_mb: 65_536,
        total_disk_mb: 512_000,
        available_cpus: 8,
        available_memory_mb: 32_000,
        available_disk_mb: 400_000,
        base_images: images.iter().map(|s| s.to_string()).collect(),
        source_vms: vec![],
        bridges: vec![],
    }
}

struct Harness {
    registry: Arc<HostRegistry>,
    correlation: Arc<CorrelationTable>,
    store: StoreHandle,
    config: SessionConfig,
    shutdown: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    dispatcher: Dispatcher,
    out_tx: mpsc::Sender<(PeerId, ControlEnvelope)>,
    out_rx: mpsc::Receiver<(PeerId, ControlEnvelope)>,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let registry = Arc::new(HostRegistry::new());
        let correlation = Arc::new(CorrelationTable::new());
        let (store, _writer) = spawn_store_writer(Arc::new(NullStore), 16);
        let (shutdown, _) = broadcast::channel(1);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (out_tx, out_rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            correlation.clone(),
            Duration::from_secs(5),
            shutting_down.clone(),
        );
        Self {
            registry,
            correlation,
            store,
            config,
            shutdown,
            shutting_down,
            dispatcher,
            out_tx,
            out_rx,
        }
    }

    fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Spawn a session for one fake peer, returning its inbound half.
    fn connect(
        &self,
        peer: &str,
    ) -> (
        mpsc::Sender<HostEnvelope>,
        JoinHandle<Result<(), SessionError>>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(64);
        let peer = PeerId::from(Bytes::copy_from_slice(peer.as_bytes()));
        let sender = SendHandle::new(peer.clone(), self.out_tx.clone());
        let ctx = SessionContext {
            registry: self.registry.clone(),
            correlation: self.correlation.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        };
        let handle = tokio::spawn(run_session(ctx, peer, in_rx, sender));
        (in_tx, handle)
    }

    /// Register a host through an already-connected peer and consume the ack.
    async fn register(
        &mut self,
        host_tx: &mpsc::Sender<HostEnvelope>,
        reg: HostRegistration,
    ) {
        let reg_id = format!("reg-{}", reg.host_id);
        host_tx
            .send(HostEnvelope::new(
                reg_id.clone(),
                HostPayload::Registration(reg),
            ))
            .await
            .unwrap();

        let (_peer, ack) = self.expect_outbound().await;
        assert_eq!(ack.request_id, reg_id);
        match ack.payload {
            ControlPayload::RegistrationAck {
                accepted: true, ..
            } => {}
            other => panic!("expected accepting ack, got {other:?}"),
        }
    }

    async fn expect_outbound(&mut self) -> (PeerId, ControlEnvelope) {
        tokio::time::timeout(Duration::from_secs(2), self.out_rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }
}

async fn wait_for(what: &str, mut probe: impl FnMut() -> bool) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn run_command(request_id: &str) -> ControlEnvelope {
    ControlEnvelope::new(
        request_id,
        ControlPayload::RunCommand {
            sandbox_id: "sb-1".to_string(),
            command: vec!["true".to_string()],
            timeout_secs: None,
        },
    )
}

#[tokio::test]
async fn happy_path_dispatch() {
    let mut harness = Harness::with_defaults();
    let (host_tx, _session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &["ubuntu-22.04"]))
        .await;

    let dispatcher = harness.dispatcher.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .send_and_wait(
                "h1",
                ControlEnvelope::new(
                    "r1",
                    ControlPayload::CreateSandbox {
                        name: "web".to_string(),
                        image: "ubuntu-22.04".to_string(),
                        cpus: 2,
                        memory_mb: 2048,
                        disk_mb: 10_240,
                        bridge: None,
                    },
                ),
                Some(Duration::from_secs(5)),
            )
            .await
    });

    let (_peer, outbound) = harness.expect_outbound().await;
    assert_eq!(outbound.request_id, "r1");
    assert!(matches!(
        outbound.payload,
        ControlPayload::CreateSandbox { .. }
    ));

    host_tx
        .send(HostEnvelope::new(
            "r1",
            HostPayload::CreateSandboxResponse {
                sandbox_id: "sb-1".to_string(),
                ip: Some("10.40.0.17".to_string()),
            },
        ))
        .await
        .unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.request_id, "r1");
    match response.payload {
        HostPayload::CreateSandboxResponse { sandbox_id, ip } => {
            assert_eq!(sandbox_id, "sb-1");
            assert_eq!(ip.as_deref(), Some("10.40.0.17"));
        }
        other => panic!("expected create response, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_then_late_response_is_dropped() {
    let mut harness = Harness::with_defaults();
    let (host_tx, _session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &["ubuntu-22.04"]))
        .await;

    let result = harness
        .dispatcher
        .send_and_wait("h1", run_command("r2"), Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(DispatchError::Timeout(id)) if id == "r2"));

    // Drain the command the session dutifully sent.
    let (_peer, outbound) = harness.expect_outbound().await;
    assert_eq!(outbound.request_id, "r2");

    // The straggler response finds no slot and is dropped with a warning;
    // the session and registry are unaffected.
    host_tx
        .send(HostEnvelope::new(
            "r2",
            HostPayload::RunCommandResponse {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        ))
        .await
        .unwrap();

    wait_for("correlation table to drain", || harness.correlation.is_empty()).await;
    assert_eq!(harness.registry.get("h1").unwrap().status, HostStatus::Online);
}

#[tokio::test]
async fn disconnect_with_outstanding_call() {
    let mut harness = Harness::with_defaults();
    let (host_tx, session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &["ubuntu-22.04"]))
        .await;

    let dispatcher = harness.dispatcher.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r3"), Some(Duration::from_secs(10)))
            .await
    });

    let (_peer, outbound) = harness.expect_outbound().await;
    assert_eq!(outbound.request_id, "r3");

    // Peer EOF: the transport dropped the stream.
    drop(host_tx);

    let result = call.await.unwrap();
    assert!(matches!(result, Err(DispatchError::HostDisconnected)));
    session.await.unwrap().unwrap();
    assert!(harness.dispatcher.list_hosts().is_empty());
}

#[tokio::test]
async fn reconnect_replaces_prior_session() {
    let mut harness = Harness::with_defaults();
    let (host_a, session_a) = harness.connect("peer-a");
    harness
        .register(&host_a, registration("h1", &["ubuntu-22.04"]))
        .await;

    let dispatcher = harness.dispatcher.clone();
    let stuck = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r3"), Some(Duration::from_secs(10)))
            .await
    });
    let (peer_a, _outbound) = harness.expect_outbound().await;

    // Same host id arrives on a new stream while session A is still live.
    let (host_b, _session_b) = harness.connect("peer-b");
    harness
        .register(&host_b, registration("h1", &["ubuntu-22.04", "debian-12"]))
        .await;

    let result = stuck.await.unwrap();
    assert!(matches!(result, Err(DispatchError::HostDisconnected)));

    // The displaced session winds down without evicting its successor.
    session_a.await.unwrap().unwrap();
    let hosts = harness.dispatcher.list_hosts();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].host_id, "h1");
    assert_eq!(
        hosts[0]
            .snapshot
            .as_ref()
            .map(|s| s.base_images.clone())
            .unwrap_or_default(),
        vec!["ubuntu-22.04".to_string(), "debian-12".to_string()]
    );

    // New calls ride the new stream.
    let dispatcher = harness.dispatcher.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r4"), Some(Duration::from_secs(5)))
            .await
    });
    let (peer_b, outbound) = harness.expect_outbound().await;
    assert_eq!(outbound.request_id, "r4");
    assert_ne!(peer_a, peer_b);
    host_b
        .send(HostEnvelope::new(
            "r4",
            HostPayload::RunCommandResponse {
                exit_code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
            },
        ))
        .await
        .unwrap();
    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn reregistration_on_live_stream_fails_outstanding_calls() {
    let mut harness = Harness::with_defaults();
    let (host_tx, _session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &["ubuntu-22.04"]))
        .await;

    let dispatcher = harness.dispatcher.clone();
    let stuck = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r5"), Some(Duration::from_secs(10)))
            .await
    });
    let (_peer, _outbound) = harness.expect_outbound().await;

    // The same stream re-registers (daemon restart behind a proxy).
    harness
        .register(&host_tx, registration("h1", &["debian-12"]))
        .await;

    let result = stuck.await.unwrap();
    assert!(matches!(result, Err(DispatchError::HostDisconnected)));

    let host = harness.dispatcher.get_host("h1").unwrap();
    assert_eq!(
        host.snapshot.map(|s| s.base_images),
        Some(vec!["debian-12".to_string()])
    );
}

#[tokio::test]
async fn bad_handshake_rejects_stream() {
    let harness = Harness::with_defaults();
    let (host_tx, session) = harness.connect("peer-a");

    host_tx
        .send(HostEnvelope::new(
            "r1",
            HostPayload::RunCommandResponse {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        ))
        .await
        .unwrap();

    let result = session.await.unwrap();
    assert!(matches!(result, Err(SessionError::BadHandshake(_))));
    assert!(harness.registry.list().is_empty());
}

#[tokio::test]
async fn empty_host_id_is_nacked() {
    let mut harness = Harness::with_defaults();
    let (host_tx, session) = harness.connect("peer-a");

    host_tx
        .send(HostEnvelope::new(
            "reg-1",
            HostPayload::Registration(registration("", &[])),
        ))
        .await
        .unwrap();

    let (_peer, nack) = harness.expect_outbound().await;
    assert!(matches!(
        nack.payload,
        ControlPayload::RegistrationAck {
            accepted: false,
            ..
        }
    ));
    assert!(matches!(
        session.await.unwrap(),
        Err(SessionError::Rejected(_))
    ));
    assert!(harness.registry.list().is_empty());
}

#[tokio::test]
async fn invalid_request_ids() {
    let mut harness = Harness::with_defaults();
    let (host_tx, _session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &[]))
        .await;

    // Empty id refused before anything is sent.
    let result = harness
        .dispatcher
        .send_and_wait("h1", run_command(""), None)
        .await;
    assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));

    // Duplicate id collides with the in-flight reservation.
    let dispatcher = harness.dispatcher.clone();
    let first = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r9"), Some(Duration::from_secs(5)))
            .await
    });
    let (_peer, _outbound) = harness.expect_outbound().await;

    let result = harness
        .dispatcher
        .send_and_wait("h1", run_command("r9"), None)
        .await;
    assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));

    host_tx
        .send(HostEnvelope::new(
            "r9",
            HostPayload::RunCommandResponse {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        ))
        .await
        .unwrap();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_host_is_not_connected() {
    let harness = Harness::with_defaults();
    let result = harness
        .dispatcher
        .send_and_wait("ghost", run_command("r1"), None)
        .await;
    assert!(matches!(result, Err(DispatchError::NotConnected(id)) if id == "ghost"));
}

#[tokio::test]
async fn image_selection() {
    let mut harness = Harness::with_defaults();
    let (host_a, _sa) = harness.connect("peer-a");
    harness
        .register(&host_a, registration("h1", &["ubuntu-22.04"]))
        .await;
    let (host_b, _sb) = harness.connect("peer-b");
    harness
        .register(&host_b, registration("h2", &["debian-12"]))
        .await;

    assert_eq!(
        harness
            .dispatcher
            .select_host_for_image("debian-12")
            .map(|h| h.host_id),
        Some("h2".to_string())
    );
    assert!(harness.dispatcher.select_host_for_image("centos-9").is_none());
}

#[tokio::test]
async fn overdue_marking_and_recovery() {
    let mut harness = Harness::new(SessionConfig {
        heartbeat_check_interval: Duration::from_millis(50),
        heartbeat_overdue_threshold: Duration::from_millis(100),
    });
    let (host_tx, _session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &["ubuntu-22.04"]))
        .await;

    wait_for("host to go overdue", || {
        harness.registry.get("h1").map(|h| h.status) == Some(HostStatus::Overdue)
    })
    .await;

    // Overdue hosts are not placement candidates.
    assert!(harness.dispatcher.select_host_for_image("ubuntu-22.04").is_none());

    // A heartbeat brings it straight back.
    host_tx
        .send(HostEnvelope::new(
            "hb-1",
            HostPayload::Heartbeat {
                available_cpus: 8,
                available_memory_mb: 32_000,
                available_disk_mb: 400_000,
            },
        ))
        .await
        .unwrap();

    wait_for("host to recover", || {
        harness.registry.get("h1").map(|h| h.status) == Some(HostStatus::Online)
    })
    .await;
    assert!(harness
        .dispatcher
        .select_host_for_image("ubuntu-22.04")
        .is_some());
}

#[tokio::test]
async fn shutdown_resolves_inflight_and_refuses_new_calls() {
    let mut harness = Harness::with_defaults();
    let (host_tx, session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &[]))
        .await;

    let dispatcher = harness.dispatcher.clone();
    let stuck = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r7"), Some(Duration::from_secs(10)))
            .await
    });
    let (_peer, _outbound) = harness.expect_outbound().await;

    // What ControlPlane::shutdown does, piece by piece.
    harness
        .shutting_down
        .store(true, std::sync::atomic::Ordering::SeqCst);
    harness
        .correlation
        .cancel_all(corral::correlation::FailureReason::Shutdown);
    let _ = harness.shutdown.send(());

    assert!(matches!(
        stuck.await.unwrap(),
        Err(DispatchError::Shutdown)
    ));
    assert!(matches!(
        harness
            .dispatcher
            .send_and_wait("h1", run_command("r8"), None)
            .await,
        Err(DispatchError::Shutdown)
    ));
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn caller_cancellation_releases_the_slot() {
    let mut harness = Harness::with_defaults();
    let (host_tx, _session) = harness.connect("peer-a");
    harness
        .register(&host_tx, registration("h1", &[]))
        .await;

    let cancel = CancellationToken::new();
    let dispatcher = harness.dispatcher.clone();
    let token = cancel.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .send_and_wait_with_cancel("h1", run_command("r6"), Some(Duration::from_secs(10)), &token)
            .await
    });
    let (_peer, _outbound) = harness.expect_outbound().await;

    cancel.cancel();
    assert!(matches!(call.await.unwrap(), Err(DispatchError::Cancelled)));
    assert!(harness.correlation.is_empty());

    // The id is reusable once released.
    let dispatcher = harness.dispatcher.clone();
    let retry = tokio::spawn(async move {
        dispatcher
            .send_and_wait("h1", run_command("r6"), Some(Duration::from_secs(5)))
            .await
    });
    let (_peer, outbound) = harness.expect_outbound().await;
    assert_eq!(outbound.request_id, "r6");
    host_tx
        .send(HostEnvelope::new(
            "r6",
            HostPayload::RunCommandResponse {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        ))
        .await
        .unwrap();
    retry.await.unwrap().unwrap();
}
