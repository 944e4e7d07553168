//! Per-connection state machine for one host stream.
//!
//! A session owns a connected host from its first message to teardown:
//! handshake (`AwaitRegistration`), then the active receive loop, then a
//! teardown path that unregisters the host and fails any correlation slots
//! still bound to it.
//!
//! The session is transport-agnostic: inbound messages arrive on a channel
//! and outbound messages leave through a [`SendHandle`]. The ZMQ listener in
//! `server` adapts a ROUTER socket to these halves; tests drive sessions with
//! plain channels.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use corralproto::{ControlEnvelope, ControlPayload, HostEnvelope, HostPayload};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::correlation::{CorrelationTable, FailureReason};
use crate::monitor;
use crate::registry::{HostRegistry, RegistryError};
use crate::store::StoreHandle;

/// Transport-level peer identity for one stream (the ROUTER identity frame).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Bytes);

impl PeerId {
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl From<Bytes> for PeerId {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Capability to transmit one outbound message on a host's stream.
///
/// The registry holds one of these per host instead of a transport object;
/// all sends on a stream funnel through the owning session's serialized
/// outbound path, so concurrent dispatches never interleave.
#[derive(Clone)]
pub struct SendHandle {
    peer: PeerId,
    tx: mpsc::Sender<(PeerId, ControlEnvelope)>,
}

impl SendHandle {
    pub fn new(peer: PeerId, tx: mpsc::Sender<(PeerId, ControlEnvelope)>) -> Self {
        Self { peer, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queue an envelope for transmission. Fails only when the stream's
    /// outbound path is gone.
    pub async fn send(&self, envelope: ControlEnvelope) -> Result<(), SendClosed> {
        self.tx
            .send((self.peer.clone(), envelope))
            .await
            .map_err(|_| SendClosed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("stream outbound path is closed")]
pub struct SendClosed;

/// Knobs a session and its monitor run with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_check_interval: std::time::Duration,
    pub heartbeat_overdue_threshold: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_check_interval: std::time::Duration::from_secs(30),
            heartbeat_overdue_threshold: std::time::Duration::from_secs(90),
        }
    }
}

/// Shared state a session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<HostRegistry>,
    pub correlation: Arc<CorrelationTable>,
    pub store: StoreHandle,
    pub config: SessionConfig,
    pub shutdown: broadcast::Sender<()>,
}

/// Why a session ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer closed the stream before registering")]
    EarlyEof,
    #[error("handshake failed: first message was {0}, expected a registration")]
    BadHandshake(&'static str),
    #[error("handshake failed: {0}")]
    Rejected(#[from] RegistryError),
    #[error("outbound path closed while sending registration ack")]
    AckFailed,
}

/// Run one host stream to completion.
///
/// Returns `Ok(())` for every orderly ending (peer EOF, disconnect frame,
/// shutdown, replacement by a reconnect); errors are handshake violations.
pub async fn run_session(
    ctx: SessionContext,
    peer: PeerId,
    mut inbound: mpsc::Receiver<HostEnvelope>,
    sender: SendHandle,
) -> Result<(), SessionError> {
    // --- AwaitRegistration ---
    let Some(first) = inbound.recv().await else {
        return Err(SessionError::EarlyEof);
    };
    let (ack_id, registration) = match first.payload {
        HostPayload::Registration(registration) => (first.request_id, registration),
        other => {
            warn!(%peer, got = other.name(), "rejecting stream: first message was not a registration");
            return Err(SessionError::BadHandshake(other.name()));
        }
    };

    let session_id = Uuid::new_v4();
    let host_id = registration.host_id.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    match ctx.registry.register(
        &host_id,
        &registration.hostname,
        &registration.version,
        session_id,
        sender.clone(),
        stop_tx,
    ) {
        Ok(replaced) => {
            if let Some(prev) = replaced {
                let failed = ctx
                    .correlation
                    .cancel_session(prev.session_id, FailureReason::HostDisconnected);
                if failed > 0 {
                    warn!(host_id, failed, "reconnect failed outstanding requests");
                }
                let _ = prev.stop.try_send(());
                info!(host_id, "reconnect replaced previous session");
            }
        }
        Err(e) => {
            let nack = ControlEnvelope::new(
                ack_id,
                ControlPayload::RegistrationAck {
                    accepted: false,
                    assigned_host_id: String::new(),
                },
            );
            let _ = sender.send(nack).await;
            return Err(SessionError::Rejected(e));
        }
    }

    ctx.registry.set_registration(&host_id, registration.clone());
    ctx.store.upsert_host(&registration);

    let ack = ControlEnvelope::new(
        ack_id,
        ControlPayload::RegistrationAck {
            accepted: true,
            assigned_host_id: host_id.clone(),
        },
    );
    if sender.send(ack).await.is_err() {
        ctx.registry.unregister_session(&host_id, session_id);
        return Err(SessionError::AckFailed);
    }

    info!(host_id, %session_id, %peer, "host registered");

    // --- Active ---
    let monitor = monitor::spawn_overdue_monitor(
        ctx.registry.clone(),
        host_id.clone(),
        session_id,
        ctx.config.heartbeat_check_interval,
        ctx.config.heartbeat_overdue_threshold,
        ctx.shutdown.subscribe(),
    );

    let mut shutdown_rx = ctx.shutdown.subscribe();
    let mut teardown_reason = FailureReason::HostDisconnected;

    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(envelope) = message else {
                    debug!(host_id, "peer stream ended");
                    break;
                };
                ctx.registry.update_heartbeat(&host_id);

                if envelope.payload.is_response() {
                    let request_id = envelope.request_id.clone();
                    trace!(host_id, request_id, kind = envelope.payload.name(), "response received");
                    if !ctx.correlation.deliver(&request_id, envelope) {
                        warn!(host_id, request_id, "dropping response with no waiting request");
                    }
                    continue;
                }

                match envelope.payload {
                    HostPayload::Registration(registration) => {
                        if registration.host_id != host_id {
                            warn!(
                                host_id,
                                claimed = registration.host_id,
                                "re-registration with a different host id, closing stream"
                            );
                            break;
                        }
                        let failed = ctx
                            .correlation
                            .cancel_session(session_id, FailureReason::HostDisconnected);
                        if failed > 0 {
                            warn!(host_id, failed, "re-registration failed outstanding requests");
                        }
                        ctx.registry.set_registration(&host_id, registration.clone());
                        ctx.registry.update_heartbeat(&host_id);
                        ctx.store.upsert_host(&registration);
                        let ack = ControlEnvelope::new(
                            envelope.request_id,
                            ControlPayload::RegistrationAck {
                                accepted: true,
                                assigned_host_id: host_id.clone(),
                            },
                        );
                        if sender.send(ack).await.is_err() {
                            break;
                        }
                        info!(host_id, "host re-registered on live stream");
                    }
                    HostPayload::Heartbeat { available_cpus, available_memory_mb, available_disk_mb } => {
                        trace!(host_id, available_cpus, "heartbeat");
                        ctx.registry.set_availability(
                            &host_id,
                            available_cpus,
                            available_memory_mb,
                            available_disk_mb,
                        );
                        ctx.store.record_heartbeat(
                            &host_id,
                            available_cpus,
                            available_memory_mb,
                            available_disk_mb,
                        );
                    }
                    HostPayload::ResourceReport { sandbox_count, .. } => {
                        // Liveness only; availability is owned by heartbeats.
                        trace!(host_id, sandbox_count, "resource report");
                    }
                    HostPayload::ErrorReport { sandbox_id, error, context } => {
                        error!(
                            host_id,
                            sandbox_id = sandbox_id.as_deref().unwrap_or("-"),
                            %error,
                            ?context,
                            "host reported an error"
                        );
                    }
                    HostPayload::Disconnect { reason } => {
                        info!(host_id, reason = reason.as_deref().unwrap_or("-"), "host disconnecting");
                        break;
                    }
                    // is_response() routed the rest above; anything landing
                    // here means the classification drifted.
                    other => {
                        warn!(host_id, kind = other.name(), "unhandled payload variant, dropping");
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                debug!(host_id, "session observing shutdown");
                teardown_reason = FailureReason::Shutdown;
                break;
            }

            _ = stop_rx.recv() => {
                // A reconnect replaced this session; the replacer already
                // owns the registry entry and failed our slots.
                debug!(host_id, %session_id, "session replaced by reconnect");
                monitor.abort();
                return Ok(());
            }
        }
    }

    // --- TearingDown ---
    monitor.abort();
    ctx.registry.unregister_session(&host_id, session_id);
    let failed = ctx.correlation.cancel_session(session_id, teardown_reason);
    if failed > 0 {
        warn!(host_id, failed, "failed outstanding requests on teardown");
    }
    info!(host_id, %session_id, "session closed");
    Ok(())
}
