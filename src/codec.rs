//! Framed message codec and stream reassembler.
//!
//! Frames are MessagePack values concatenated on the byte stream with no
//! length prefix; the unpacker relies on the encoding being self-delimiting
//! to find frame boundaries, buffering partial frames across reads.

use bytes::{Buf, BytesMut};

use crate::error::CodecError;
use crate::message::Message;

/// Reassembles an arbitrarily-split byte stream into framed messages.
#[derive(Debug, Default)]
pub struct Unpacker {
    buf: BytesMut,
}

impl Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes`, then decode every complete frame at the head of the
    /// buffer.
    ///
    /// Messages come out in stream order regardless of how the byte stream
    /// was split across calls; a trailing partial frame is retained for the
    /// next call. A syntactically invalid frame fails with
    /// [`CodecError::Malformed`], leaving the buffer positioned at the
    /// offending frame so the caller can abandon the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, CodecError> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();
        while !self.buf.is_empty() {
            let mut cursor = std::io::Cursor::new(&self.buf[..]);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => {
                    let consumed = cursor.position() as usize;
                    let message = Message::from_value(value)?;
                    self.buf.advance(consumed);
                    messages.push(message);
                }
                Err(err) if is_truncated(&err) => break,
                Err(err) => return Err(CodecError::Malformed(err.to_string())),
            }
        }
        Ok(messages)
    }

    /// Bytes retained from an incomplete trailing frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// An UnexpectedEof underneath the decode error means the frame has simply
// not fully arrived yet; anything else is garbage on the wire.
fn is_truncated(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Serialise one message using the wire convention.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &message.to_value())
        .expect("writing MessagePack to a Vec cannot fail");
    out
}
