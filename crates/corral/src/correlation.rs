//! Request/response correlation over the host stream.
//!
//! Synchronous call semantics are built on single-shot delivery slots keyed
//! by request id: the dispatcher reserves a slot before the message is
//! serialized, the session delivers the matching response into it, and
//! whoever removes the slot first (delivery, timeout, disconnect, shutdown)
//! is the one resolution the waiter observes. A late delivery finds no slot
//! and is dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use corralproto::HostEnvelope;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

/// Why a slot was resolved without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The owning session ended while the request was outstanding.
    HostDisconnected,
    /// The control plane is tearing down.
    Shutdown,
}

/// What a waiter receives on its slot.
#[derive(Debug)]
pub enum Delivery {
    Response(HostEnvelope),
    Failed(FailureReason),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReserveError {
    #[error("request id must not be empty")]
    EmptyRequestId,
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(String),
}

struct Slot {
    session_id: Uuid,
    tx: oneshot::Sender<Delivery>,
}

/// Shared map of in-flight requests.
pub struct CorrelationTable {
    slots: Mutex<HashMap<String, Slot>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically insert a single-shot slot for `request_id`.
    ///
    /// The returned receiver resolves with exactly one [`Delivery`]; if the
    /// caller abandons it, it must remove the slot with [`discard`].
    ///
    /// [`discard`]: CorrelationTable::discard
    pub fn reserve(
        &self,
        request_id: &str,
        session_id: Uuid,
    ) -> Result<oneshot::Receiver<Delivery>, ReserveError> {
        if request_id.is_empty() {
            return Err(ReserveError::EmptyRequestId);
        }
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(request_id) {
            return Err(ReserveError::DuplicateRequestId(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(request_id.to_string(), Slot { session_id, tx });
        Ok(rx)
    }

    /// Hand a response to the waiter for `request_id`, removing the slot.
    ///
    /// Returns false when no slot exists - the expected outcome for a
    /// response whose caller already timed out.
    pub fn deliver(&self, request_id: &str, envelope: HostEnvelope) -> bool {
        let slot = self.slots.lock().unwrap().remove(request_id);
        match slot {
            Some(slot) => {
                if slot.tx.send(Delivery::Response(envelope)).is_err() {
                    // Waiter went away without discarding; nothing to do.
                    warn!(request_id, "response delivered to an abandoned slot");
                }
                true
            }
            None => false,
        }
    }

    /// Remove a slot without waking its waiter. Used by the waiter itself on
    /// timeout or cancellation. Returns false if the slot was already
    /// resolved by another path.
    pub fn discard(&self, request_id: &str) -> bool {
        self.slots.lock().unwrap().remove(request_id).is_some()
    }

    /// Remove a slot and wake its waiter with `reason`.
    pub fn cancel(&self, request_id: &str, reason: FailureReason) -> bool {
        let slot = self.slots.lock().unwrap().remove(request_id);
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(Delivery::Failed(reason));
                true
            }
            None => false,
        }
    }

    /// Fail every slot bound to `session_id`. Returns how many were failed.
    pub fn cancel_session(&self, session_id: Uuid, reason: FailureReason) -> usize {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap();
            let ids: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| slot.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| slots.remove(&id)).collect()
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Delivery::Failed(reason));
        }
        count
    }

    /// Fail every slot in the table. Returns how many were failed.
    pub fn cancel_all(&self, reason: FailureReason) -> usize {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Delivery::Failed(reason));
        }
        count
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
