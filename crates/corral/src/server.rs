//! ZMQ ROUTER listener and control-plane lifecycle.
//!
//! One task owns the ROUTER socket: inbound multiparts are decoded and routed
//! by transport identity to the owning session's channel; outbound envelopes
//! from every session funnel through a single queue back onto the socket, so
//! sends on a stream are serialized. Sessions themselves are spawned tasks
//! running [`crate::session::run_session`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use corralconf::CorralConfig;
use corralproto::socket::{bind_router, frames_to_zmq, zmq_to_frames};
use corralproto::{ControlEnvelope, ControlPayload, HostEnvelope, HostPayload, WireFrame};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use zeromq::{RouterSocket, SocketRecv, SocketSend, ZmqMessage};

use crate::correlation::{CorrelationTable, FailureReason};
use crate::dispatcher::Dispatcher;
use crate::registry::HostRegistry;
use crate::session::{self, PeerId, SendHandle, SessionConfig, SessionContext};
use crate::store::{spawn_store_writer, HostStore, StoreHandle};

/// Queue depth for the shared outbound path back onto the ROUTER socket.
const OUTBOUND_QUEUE: usize = 256;

/// Queue depth for one session's inbound messages.
const SESSION_INBOUND_QUEUE: usize = 64;

/// Queue depth for pending store writes.
const STORE_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// ROUTER endpoint host streams connect to.
    pub bind_address: String,
    pub session: SessionConfig,
    /// Used by the dispatcher when a caller does not specify a timeout.
    pub default_request_timeout: Duration,
    /// Refuse new sessions past this count. Unlimited when unset.
    pub max_sessions: Option<usize>,
}

impl ControlPlaneConfig {
    pub fn from_config(config: &CorralConfig) -> Self {
        Self {
            bind_address: config.bind.router.clone(),
            session: SessionConfig {
                heartbeat_check_interval: config.heartbeat_check_interval(),
                heartbeat_overdue_threshold: config.heartbeat_overdue_threshold(),
            },
            default_request_timeout: config.default_request_timeout(),
            max_sessions: config.limits.max_sessions,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_address: "tcp://127.0.0.1:5670".to_string(),
            session: SessionConfig::default(),
            default_request_timeout: Duration::from_secs(30),
            max_sessions: None,
        }
    }
}

/// The control-plane core: registry, correlation table, store writer, and
/// the listener loop. Construct once, hand out [`Dispatcher`] handles, then
/// drive [`run`](ControlPlane::run) until shutdown.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: Arc<HostRegistry>,
    correlation: Arc<CorrelationTable>,
    store: StoreHandle,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl ControlPlane {
    /// Build the control plane. Spawns the background store writer, so this
    /// must run inside a Tokio runtime.
    pub fn new(config: ControlPlaneConfig, store: Arc<dyn HostStore>) -> Self {
        let (store_handle, _writer) = spawn_store_writer(store, STORE_QUEUE);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(HostRegistry::new()),
            correlation: Arc::new(CorrelationTable::new()),
            store: store_handle,
            shutdown_tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle implementing the dispatch facade, for the orchestrator layer.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            self.correlation.clone(),
            self.config.default_request_timeout,
            self.shutting_down.clone(),
        )
    }

    /// Registry queries, for "list hosts" style endpoints.
    pub fn registry(&self) -> Arc<HostRegistry> {
        self.registry.clone()
    }

    /// Begin teardown: refuse new dispatches, fail every in-flight request
    /// with `Shutdown`, and signal the listener and all sessions. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = self.correlation.cancel_all(FailureReason::Shutdown);
        if failed > 0 {
            warn!(failed, "cancelled in-flight requests for shutdown");
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the ROUTER socket and serve until [`shutdown`](ControlPlane::shutdown).
    pub async fn run(&self) -> Result<()> {
        let mut socket = bind_router(&self.config.bind_address).await?;
        info!("control plane listening on {}", self.config.bind_address);

        let (out_tx, mut out_rx) = mpsc::channel::<(PeerId, ControlEnvelope)>(OUTBOUND_QUEUE);
        let (done_tx, mut done_rx) = mpsc::channel::<PeerId>(SESSION_INBOUND_QUEUE);
        let mut sessions: HashMap<PeerId, mpsc::Sender<HostEnvelope>> = HashMap::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = socket.recv() => {
                    match result {
                        Ok(message) => {
                            self.route_inbound(message, &mut sessions, &out_tx, &done_tx);
                        }
                        Err(e) => {
                            warn!("router receive error: {e}");
                        }
                    }
                }

                Some((peer, envelope)) = out_rx.recv() => {
                    send_to_peer(&mut socket, peer, envelope).await;
                }

                Some(peer) = done_rx.recv() => {
                    // Only drop the entry if it still points at the finished
                    // session; the peer may have already been respawned.
                    if sessions.get(&peer).is_some_and(|tx| tx.is_closed()) {
                        sessions.remove(&peer);
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("listener observing shutdown");
                    break;
                }
            }
        }

        self.shutdown();
        info!("control plane stopped");
        Ok(())
    }

    /// Decode one inbound multipart and route it by transport identity.
    /// Unknown peers get a fresh session; the session owns the handshake.
    fn route_inbound(
        &self,
        message: ZmqMessage,
        sessions: &mut HashMap<PeerId, mpsc::Sender<HostEnvelope>>,
        out_tx: &mpsc::Sender<(PeerId, ControlEnvelope)>,
        done_tx: &mpsc::Sender<PeerId>,
    ) {
        let frames = zmq_to_frames(message);
        let (identity, frame) = match WireFrame::from_frames_with_identity(&frames) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping malformed frame: {e}");
                return;
            }
        };
        let Some(peer_bytes) = identity.first() else {
            warn!("dropping frame without a transport identity");
            return;
        };
        let peer = PeerId::from(peer_bytes.clone());

        let envelope = match HostEnvelope::from_frame(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%peer, "dropping undecodable payload: {e}");
                return;
            }
        };

        // Existing session: hand the message over without blocking the
        // listener. A closed channel means the session already ended; fall
        // through and treat the peer as new.
        let envelope = match sessions.get(&peer) {
            Some(tx) => match tx.try_send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%peer, "session inbound queue full, dropping message");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(envelope)) => envelope,
            },
            None => envelope,
        };
        sessions.remove(&peer);

        if let Some(cap) = self.config.max_sessions {
            if sessions.len() >= cap {
                warn!(%peer, cap, "refusing new session: at capacity");
                if matches!(envelope.payload, HostPayload::Registration(_)) {
                    let nack = ControlEnvelope::new(
                        envelope.request_id.clone(),
                        ControlPayload::RegistrationAck {
                            accepted: false,
                            assigned_host_id: String::new(),
                        },
                    );
                    let _ = out_tx.try_send((peer, nack));
                }
                return;
            }
        }

        let (in_tx, in_rx) = mpsc::channel(SESSION_INBOUND_QUEUE);
        let sender = SendHandle::new(peer.clone(), out_tx.clone());
        let ctx = SessionContext {
            registry: self.registry.clone(),
            correlation: self.correlation.clone(),
            store: self.store.clone(),
            config: self.config.session.clone(),
            shutdown: self.shutdown_tx.clone(),
        };

        if in_tx.try_send(envelope).is_err() {
            // Fresh channel with capacity; cannot happen.
            return;
        }
        sessions.insert(peer.clone(), in_tx);

        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = session::run_session(ctx, peer.clone(), in_rx, sender).await {
                debug!(%peer, "session ended: {e}");
            }
            let _ = done_tx.send(peer).await;
        });
    }
}

async fn send_to_peer(socket: &mut RouterSocket, peer: PeerId, envelope: ControlEnvelope) {
    let frame = match envelope.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%peer, "failed to encode outbound message: {e}");
            return;
        }
    };
    let frames = frame.to_frames_with_identity(std::slice::from_ref(peer.as_bytes()));
    let Some(message) = frames_to_zmq(frames) else {
        return;
    };
    if let Err(e) = socket.send(message).await {
        warn!(%peer, "outbound send failed: {e}");
    }
}
