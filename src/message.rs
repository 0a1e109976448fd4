//! Wire frames.
//!
//! Every frame on the wire is a MessagePack array `[session, kind, payload]`.
//! Session 0 is reserved for control traffic (handshake, heartbeats,
//! terminate); every other session id names an independent conversation
//! multiplexed over the single connection.

use bytes::Bytes;
use rmpv::Value;

use crate::error::CodecError;

/// Session id reserved for control traffic.
pub const CONTROL_SESSION: u64 = 0;

/// Frame kinds.
///
/// The numeric values are part of the wire contract and must match the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum FrameKind {
    /// First frame a worker sends, introducing its identity.
    Handshake = 0,
    /// Keep-alive, sent in both directions.
    Heartbeat = 1,
    /// The runtime asks the worker to shut down.
    Terminate = 2,
    /// Opens a new session and names the event to be handled.
    Invoke = 3,
    /// One payload element for a session.
    Chunk = 4,
    /// A session-level error report.
    Error = 5,
    /// Terminator ending a session's stream.
    Choke = 6,
}

impl FrameKind {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Terminate),
            3 => Some(Self::Invoke),
            4 => Some(Self::Chunk),
            5 => Some(Self::Error),
            6 => Some(Self::Choke),
            _ => None,
        }
    }
}

/// One framed message.
///
/// `kind` stays a raw integer so frames with unknown kinds survive decoding
/// and reach the dispatch table, which logs and drops them.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub session: u64,
    pub kind: u64,
    pub payload: Vec<Value>,
}

impl Message {
    pub fn new(session: u64, kind: FrameKind, payload: Vec<Value>) -> Self {
        Self {
            session,
            kind: kind as u64,
            payload,
        }
    }

    pub fn handshake(id: &str) -> Self {
        Self::new(CONTROL_SESSION, FrameKind::Handshake, vec![Value::from(id)])
    }

    pub fn heartbeat() -> Self {
        Self::new(CONTROL_SESSION, FrameKind::Heartbeat, vec![])
    }

    pub fn invoke(session: u64, event: &str) -> Self {
        Self::new(session, FrameKind::Invoke, vec![Value::from(event)])
    }

    pub fn chunk(session: u64, data: impl Into<Vec<u8>>) -> Self {
        Self::new(session, FrameKind::Chunk, vec![Value::from(data.into())])
    }

    pub fn error(session: u64, code: i64, text: &str) -> Self {
        Self::new(
            session,
            FrameKind::Error,
            vec![Value::from(code), Value::from(text)],
        )
    }

    pub fn choke(session: u64) -> Self {
        Self::new(session, FrameKind::Choke, vec![])
    }

    /// The checked view of `kind`; `None` for wire values this crate does
    /// not know.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::from_u64(self.kind)
    }

    /// The data blob of a `chunk` frame: its first payload element.
    pub fn into_chunk_data(self) -> Option<Bytes> {
        match self.payload.into_iter().next()? {
            Value::Binary(data) => Some(Bytes::from(data)),
            Value::String(text) => text.into_str().map(|s| Bytes::from(s.into_bytes())),
            _ => None,
        }
    }

    /// The event name of an `invoke` frame: its first payload element.
    pub fn event_name(&self) -> Option<&str> {
        self.payload.first()?.as_str()
    }

    /// Code and reason of a `terminate` frame, defaulted when absent.
    pub fn terminate_info(&self) -> (i64, &str) {
        let code = self.payload.first().and_then(Value::as_i64).unwrap_or(0);
        let reason = self.payload.get(1).and_then(Value::as_str).unwrap_or("");
        (code, reason)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        let Value::Array(fields) = value else {
            return Err(CodecError::Malformed("frame is not an array".into()));
        };
        if fields.len() != 3 {
            return Err(CodecError::Malformed(format!(
                "frame has {} elements, expected 3",
                fields.len()
            )));
        }
        let mut fields = fields.into_iter();
        let (Some(session), Some(kind), Some(payload)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(CodecError::Malformed("frame truncated".into()));
        };
        let session = session
            .as_u64()
            .ok_or_else(|| CodecError::Malformed("session is not an unsigned integer".into()))?;
        let kind = kind
            .as_u64()
            .ok_or_else(|| CodecError::Malformed("kind is not an unsigned integer".into()))?;
        let Value::Array(payload) = payload else {
            return Err(CodecError::Malformed("payload is not an array".into()));
        };
        Ok(Self {
            session,
            kind,
            payload,
        })
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.session),
            Value::from(self.kind),
            Value::Array(self.payload.clone()),
        ])
    }
}
