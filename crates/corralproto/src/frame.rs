//! CRRL01 frame protocol
//!
//! A frame-based wire format for the corral host stream. Keeping the
//! request id in its own frame means the control plane can correlate
//! replies without touching the body.
//!
//! ## Wire Format
//!
//! A CRRL01 message is a 4-frame multipart message:
//!
//! ```text
//! Frame 0: Protocol version    "CRRL01" (6 bytes)
//! Frame 1: Kind                2 bytes (big-endian u16)
//! Frame 2: Request ID          UTF-8 string (non-empty)
//! Frame 3: Body                JSON payload
//! ```
//!
//! ## ROUTER Socket Handling
//!
//! When using ROUTER sockets, the transport prepends identity frame(s).
//! We scan for "CRRL01" to find frame 0, preserving identity frames for
//! reply routing.

use bytes::{BufMut, Bytes, BytesMut};

/// Protocol version - bump on breaking changes
pub const PROTOCOL_VERSION: &[u8] = b"CRRL01";

/// Number of frames in a CRRL01 message (excluding identity prefix)
pub const FRAME_COUNT: usize = 4;

/// Kind of a CRRL01 message (2 bytes, big-endian)
///
/// Routing happens on this field alone; the JSON body is only decoded by
/// whoever actually consumes the message.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Host announces itself and its inventory (host -> control plane)
    Register = 0x0001,
    /// Command dispatched to a host (control plane -> host)
    Request = 0x0002,
    /// Reply correlated by request id (both directions)
    Reply = 0x0003,
    /// Liveness signal with current availability (host -> control plane)
    Heartbeat = 0x0004,
    /// Graceful teardown notification (host -> control plane)
    Disconnect = 0x0005,
    /// Unsolicited resource or error report (host -> control plane)
    Report = 0x0006,
}

impl FrameKind {
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0x0001 => Ok(FrameKind::Register),
            0x0002 => Ok(FrameKind::Request),
            0x0003 => Ok(FrameKind::Reply),
            0x0004 => Ok(FrameKind::Heartbeat),
            0x0005 => Ok(FrameKind::Disconnect),
            0x0006 => Ok(FrameKind::Report),
            other => Err(FrameError::InvalidKind(other)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Errors during frame parsing
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid protocol version: expected CRRL01")]
    InvalidProtocol,
    #[error("missing frame: {0}")]
    MissingFrame(&'static str),
    #[error("invalid frame kind: {0:#06x}")]
    InvalidKind(u16),
    #[error("request id must not be empty")]
    EmptyRequestId,
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("body decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A parsed CRRL01 multipart message
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub kind: FrameKind,
    pub request_id: String,
    pub body: Bytes,
}

impl WireFrame {
    pub fn new(kind: FrameKind, request_id: impl Into<String>, body: Bytes) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            body,
        }
    }

    /// Parse a list of frame bytes into a WireFrame.
    ///
    /// Scans for CRRL01 to find the protocol frame, tolerating any identity
    /// prefix a ROUTER socket may add.
    pub fn from_frames(frames: &[Bytes]) -> Result<Self, FrameError> {
        let (_, frame) = Self::from_frames_with_identity(frames)?;
        Ok(frame)
    }

    /// Parse frames, returning identity frames separately (for ROUTER replies).
    ///
    /// Returns (identity_frames, parsed_frame) where identity_frames are any
    /// frames before the CRRL01 protocol marker.
    pub fn from_frames_with_identity(frames: &[Bytes]) -> Result<(Vec<Bytes>, Self), FrameError> {
        let proto_idx = frames
            .iter()
            .position(|f| f.as_ref() == PROTOCOL_VERSION)
            .ok_or(FrameError::InvalidProtocol)?;

        let identity: Vec<Bytes> = frames[..proto_idx].to_vec();

        let wire_frames = &frames[proto_idx..];
        if wire_frames.len() < FRAME_COUNT {
            return Err(FrameError::MissingFrame("insufficient frames after CRRL01"));
        }

        let kind_bytes = &wire_frames[1];
        if kind_bytes.len() != 2 {
            return Err(FrameError::MissingFrame("kind"));
        }
        let kind = FrameKind::from_u16(u16::from_be_bytes([kind_bytes[0], kind_bytes[1]]))?;

        let request_id = std::str::from_utf8(&wire_frames[2])
            .map_err(|_| FrameError::InvalidUtf8("request id"))?
            .to_string();
        if request_id.is_empty() {
            return Err(FrameError::EmptyRequestId);
        }

        let body = wire_frames[3].clone();

        Ok((identity, Self { kind, request_id, body }))
    }

    /// Serialize to the 4-frame wire form.
    pub fn to_frames(&self) -> Vec<Bytes> {
        let mut kind = BytesMut::with_capacity(2);
        kind.put_u16(self.kind.to_u16());

        vec![
            Bytes::from_static(PROTOCOL_VERSION),
            kind.freeze(),
            Bytes::from(self.request_id.clone().into_bytes()),
            self.body.clone(),
        ]
    }

    /// Serialize with an identity prefix for sending through a ROUTER socket.
    pub fn to_frames_with_identity(&self, identity: &[Bytes]) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(identity.len() + FRAME_COUNT);
        frames.extend_from_slice(identity);
        frames.extend(self.to_frames());
        frames
    }
}
