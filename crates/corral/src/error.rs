//! Error taxonomy surfaced to dispatcher callers.

use thiserror::Error;

/// One discrete outcome per `send_and_wait` call. The dispatcher never
/// retries; callers compose their own policy on top of these kinds.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Empty or duplicate request id. Not retriable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No live session for the host. Retriable after the host reconnects.
    #[error("host {0} is not connected")]
    NotConnected(String),

    /// The session's outbound path refused the message.
    #[error("send to host {host_id} failed: {reason}")]
    SendFailed { host_id: String, reason: String },

    /// Deadline elapsed before a response arrived.
    #[error("request {0} timed out")]
    Timeout(String),

    /// The session ended while the request was outstanding.
    #[error("host disconnected with request outstanding")]
    HostDisconnected,

    /// The caller's cancellation signal fired first.
    #[error("request cancelled by caller")]
    Cancelled,

    /// The control plane is tearing down. Not retriable.
    #[error("control plane is shutting down")]
    Shutdown,
}
