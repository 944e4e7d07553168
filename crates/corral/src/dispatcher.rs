//! Dispatcher facade - the surface the orchestrator consumes.
//!
//! `send_and_wait` turns the asynchronous host stream into a synchronous
//! call: reserve a correlation slot, hand the message to the session's
//! serialized send, then block on the slot until exactly one of response,
//! timeout, caller cancellation, disconnect, or shutdown resolves it. No
//! retries; callers see one discrete outcome per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corralproto::{ControlEnvelope, HostEnvelope};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::correlation::{CorrelationTable, Delivery, FailureReason, ReserveError};
use crate::error::DispatchError;
use crate::registry::{HostInfo, HostRegistry};

/// Handle for dispatching commands to connected hosts and querying the
/// registry. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HostRegistry>,
    correlation: Arc<CorrelationTable>,
    default_timeout: Duration,
    shutting_down: Arc<AtomicBool>,
}

/// Removes an abandoned slot if the waiting future is dropped before it
/// resolves, so a cancelled caller never leaks its reservation.
struct SlotGuard {
    correlation: Arc<CorrelationTable>,
    request_id: String,
    armed: bool,
}

impl SlotGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Remove the slot now. Returns false if another path already resolved it.
    fn release(&mut self) -> bool {
        self.armed = false;
        self.correlation.discard(&self.request_id)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.correlation.discard(&self.request_id);
        }
    }
}

impl Dispatcher {
    /// Assemble a dispatcher over shared registry and correlation state.
    /// `ControlPlane` does this for you; embedders running sessions over
    /// their own transport can call it directly.
    pub fn new(
        registry: Arc<HostRegistry>,
        correlation: Arc<CorrelationTable>,
        default_timeout: Duration,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            correlation,
            default_timeout,
            shutting_down,
        }
    }

    /// Dispatch one command to one host and wait for its reply.
    ///
    /// `timeout` defaults to the configured request timeout when `None`.
    pub async fn send_and_wait(
        &self,
        host_id: &str,
        envelope: ControlEnvelope,
        timeout: Option<Duration>,
    ) -> Result<HostEnvelope, DispatchError> {
        let cancel = CancellationToken::new();
        self.send_and_wait_with_cancel(host_id, envelope, timeout, &cancel)
            .await
    }

    /// Like [`send_and_wait`], with a caller-scoped cancellation signal.
    /// Cancellation resolves the waiter and releases the slot.
    ///
    /// [`send_and_wait`]: Dispatcher::send_and_wait
    pub async fn send_and_wait_with_cancel(
        &self,
        host_id: &str,
        envelope: ControlEnvelope,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<HostEnvelope, DispatchError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }

        let request_id = envelope.request_id.clone();
        if request_id.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "request id must not be empty".to_string(),
            ));
        }

        let target = self
            .registry
            .dispatch_target(host_id)
            .ok_or_else(|| DispatchError::NotConnected(host_id.to_string()))?;

        // Reserve before send: the slot must exist before the response can
        // possibly arrive.
        let mut rx = self
            .correlation
            .reserve(&request_id, target.session_id)
            .map_err(|e| match e {
                ReserveError::EmptyRequestId => {
                    DispatchError::InvalidArgument("request id must not be empty".to_string())
                }
                ReserveError::DuplicateRequestId(id) => {
                    DispatchError::InvalidArgument(format!("request id {id} is already in flight"))
                }
            })?;
        let mut guard = SlotGuard {
            correlation: self.correlation.clone(),
            request_id: request_id.clone(),
            armed: true,
        };

        debug!(host_id, request_id, command = envelope.payload.name(), "dispatching");
        if target.sender.send(envelope).await.is_err() {
            guard.release();
            return Err(DispatchError::SendFailed {
                host_id: host_id.to_string(),
                reason: "stream outbound path is closed".to_string(),
            });
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            resolution = &mut rx => {
                guard.disarm();
                match resolution {
                    Ok(Delivery::Response(response)) => Ok(response),
                    Ok(Delivery::Failed(reason)) => Err(reason.into()),
                    // The table dropped the slot without resolving it; only
                    // teardown of the whole process does that.
                    Err(_) => Err(DispatchError::Shutdown),
                }
            }

            _ = &mut sleep => {
                if guard.release() {
                    debug!(host_id, request_id, "request timed out");
                    Err(DispatchError::Timeout(request_id))
                } else {
                    // Delivery won the race against the deadline; the
                    // response is already in the channel.
                    Self::drain_raced_slot(&mut rx, request_id)
                }
            }

            _ = cancel.cancelled() => {
                if guard.release() {
                    debug!(host_id, request_id, "request cancelled by caller");
                    Err(DispatchError::Cancelled)
                } else {
                    Self::drain_raced_slot(&mut rx, request_id)
                }
            }
        }
    }

    fn drain_raced_slot(
        rx: &mut tokio::sync::oneshot::Receiver<Delivery>,
        request_id: String,
    ) -> Result<HostEnvelope, DispatchError> {
        match rx.try_recv() {
            Ok(Delivery::Response(response)) => Ok(response),
            Ok(Delivery::Failed(reason)) => Err(reason.into()),
            Err(_) => Err(DispatchError::Timeout(request_id)),
        }
    }

    // === Registry queries for the orchestrator and REST plane ===

    pub fn list_hosts(&self) -> Vec<HostInfo> {
        self.registry.list()
    }

    pub fn get_host(&self, host_id: &str) -> Option<HostInfo> {
        self.registry.get(host_id)
    }

    pub fn select_host_for_image(&self, image: &str) -> Option<HostInfo> {
        self.registry.select_host_for_image(image)
    }
}

impl From<FailureReason> for DispatchError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::HostDisconnected => DispatchError::HostDisconnected,
            FailureReason::Shutdown => DispatchError::Shutdown,
        }
    }
}
