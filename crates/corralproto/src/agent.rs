//! HostAgent - the host-daemon side of the corral stream.
//!
//! Connects a DEALER socket to the control plane, performs the registration
//! handshake, then loops: answering commands through a [`CommandHandler`],
//! sending heartbeats on a ticker, and emitting a `Disconnect` on shutdown.
//!
//! The sandbox provider behind the handler is someone else's problem; this
//! type only speaks the wire protocol. Integration tests use it as a real
//! host against an in-process control plane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as AnyhowContext, Result};
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::{DealerSocket, SocketRecv, SocketSend};

use crate::socket::{connect_dealer, frames_to_zmq, zmq_to_frames};
use crate::{
    Availability, ControlEnvelope, ControlPayload, HostEnvelope, HostPayload, HostRegistration,
    WireFrame,
};

/// Answers commands dispatched by the control plane.
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle one command; the returned payload is sent back with the
    /// command's request id.
    fn handle(&self, command: ControlPayload) -> HostPayload;

    /// Current resource availability, sampled for each heartbeat.
    fn availability(&self) -> Availability;
}

/// Configuration for a [`HostAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control-plane ROUTER endpoint (e.g. "tcp://controlplane:5670")
    pub endpoint: String,
    /// Inventory announced on connect.
    pub registration: HostRegistration,
    /// How often to send heartbeats.
    pub heartbeat_interval: Duration,
    /// How long to wait for the registration ack before giving up.
    pub registration_timeout: Duration,
}

impl AgentConfig {
    pub fn new(endpoint: impl Into<String>, registration: HostRegistration) -> Self {
        Self {
            endpoint: endpoint.into(),
            registration,
            heartbeat_interval: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// DEALER-side peer for a sandbox host.
pub struct HostAgent;

impl HostAgent {
    /// Connect, register, and serve until the shutdown signal fires.
    pub async fn run<H: CommandHandler>(
        config: AgentConfig,
        handler: Arc<H>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let host_id = config.registration.host_id.clone();
        let mut socket = connect_dealer(&config.endpoint).await?;

        // Handshake: registration out, ack back with the same request id.
        let reg_id = Uuid::new_v4().to_string();
        let registration = HostEnvelope::new(
            reg_id.clone(),
            HostPayload::Registration(config.registration.clone()),
        );
        send_envelope(&mut socket, &registration).await?;

        let ack = tokio::time::timeout(config.registration_timeout, recv_control(&mut socket))
            .await
            .context("timed out waiting for registration ack")??;
        match ack.payload {
            ControlPayload::RegistrationAck { accepted: true, .. } if ack.request_id == reg_id => {
                info!(host_id, endpoint = %config.endpoint, "registered with control plane");
            }
            ControlPayload::RegistrationAck { accepted: false, .. } => {
                bail!("control plane rejected registration for {}", host_id);
            }
            other => {
                bail!("unexpected reply to registration: {}", other.name());
            }
        }

        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                result = recv_control(&mut socket) => {
                    match result {
                        Ok(envelope) => {
                            debug!(host_id, command = envelope.payload.name(), "handling command");
                            let reply = handler.handle(envelope.payload);
                            let out = HostEnvelope::new(envelope.request_id, reply);
                            if let Err(e) = send_envelope(&mut socket, &out).await {
                                warn!(host_id, "reply send failed: {e:#}");
                            }
                        }
                        Err(e) => {
                            warn!(host_id, "receive error: {e:#}");
                        }
                    }
                }

                _ = ticker.tick() => {
                    let sample = handler.availability();
                    let heartbeat = HostEnvelope::new(
                        Uuid::new_v4().to_string(),
                        HostPayload::Heartbeat {
                            available_cpus: sample.cpus,
                            available_memory_mb: sample.memory_mb,
                            available_disk_mb: sample.disk_mb,
                        },
                    );
                    if let Err(e) = send_envelope(&mut socket, &heartbeat).await {
                        warn!(host_id, "heartbeat send failed: {e:#}");
                    }
                }

                _ = shutdown.recv() => {
                    let bye = HostEnvelope::new(
                        Uuid::new_v4().to_string(),
                        HostPayload::Disconnect { reason: Some("shutdown".to_string()) },
                    );
                    let _ = send_envelope(&mut socket, &bye).await;
                    info!(host_id, "host agent shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn recv_control(socket: &mut DealerSocket) -> Result<ControlEnvelope> {
    let message = socket.recv().await.context("dealer receive failed")?;
    let frames: Vec<Bytes> = zmq_to_frames(message);
    let frame = WireFrame::from_frames(&frames)?;
    Ok(ControlEnvelope::from_frame(&frame)?)
}

async fn send_envelope(socket: &mut DealerSocket, envelope: &HostEnvelope) -> Result<()> {
    let frame = envelope.to_frame()?;
    let message = frames_to_zmq(frame.to_frames())
        .context("empty frame list")?;
    socket.send(message).await.context("dealer send failed")
}
