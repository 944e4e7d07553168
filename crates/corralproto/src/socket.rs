//! ZMQ socket helpers shared by the control plane and host peers.
//!
//! All socket setup goes through these helpers so both sides agree on
//! conversions between CRRL01 frame lists and `ZmqMessage` multiparts.

use anyhow::{Context, Result};
use bytes::Bytes;
use zeromq::{DealerSocket, RouterSocket, Socket, ZmqMessage};

/// Bind a ROUTER socket for accepting host streams.
pub async fn bind_router(endpoint: &str) -> Result<RouterSocket> {
    let mut socket = RouterSocket::new();
    socket
        .bind(endpoint)
        .await
        .with_context(|| format!("failed to bind ROUTER to {}", endpoint))?;
    Ok(socket)
}

/// Connect a DEALER socket to the control plane.
pub async fn connect_dealer(endpoint: &str) -> Result<DealerSocket> {
    let mut socket = DealerSocket::new();
    socket
        .connect(endpoint)
        .await
        .with_context(|| format!("failed to connect DEALER to {}", endpoint))?;
    Ok(socket)
}

/// Convert a frame list into a multipart message.
///
/// Returns `None` for an empty list, which a well-formed CRRL01 message can
/// never produce.
pub fn frames_to_zmq(frames: Vec<Bytes>) -> Option<ZmqMessage> {
    let mut iter = frames.into_iter();
    let mut message = ZmqMessage::from(iter.next()?);
    for frame in iter {
        message.push_back(frame);
    }
    Some(message)
}

/// Flatten a multipart message into its frame list.
pub fn zmq_to_frames(message: ZmqMessage) -> Vec<Bytes> {
    message.into_vec()
}
