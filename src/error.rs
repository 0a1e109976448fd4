//! Error types.

use core::fmt;

/// Codec-level errors.
#[derive(Debug)]
pub enum CodecError {
    /// A syntactically invalid frame. The byte stream can no longer be
    /// trusted and the connection must be abandoned.
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed frame: {detail}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors surfaced by the worker loop, session streams and locator client.
#[derive(Debug)]
pub enum Error {
    /// The runtime stopped replying to heartbeats within the disown timeout.
    Disowned,
    /// A `Request::read` hit its caller-supplied timeout.
    Timeout,
    /// The request stream ended: a terminator arrived or the worker stopped.
    StreamClosed,
    /// The peer dropped the connection without a local stop request.
    ConnectionLost,
    /// Transport-level I/O failure.
    Io(std::io::Error),
    /// The peer sent bytes the codec could not make sense of.
    Codec(CodecError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disowned => write!(f, "disowned"),
            Self::Timeout => write!(f, "read timed out"),
            Self::StreamClosed => write!(f, "stream closed"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
