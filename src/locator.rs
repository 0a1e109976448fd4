//! Service resolver client.
//!
//! The locator is the platform's directory service: it maps a logical
//! service name to a transport endpoint plus a numeric method table. The
//! client here opens a short-lived connection, issues a single resolve call
//! and accumulates streamed reply chunks until the terminator arrives, using
//! the same framing as the worker loop.

use std::collections::HashMap;
use std::fmt;
use std::io;

use rmpv::Value;
use tokio::sync::oneshot;

use crate::error::CodecError;
use crate::message::{CONTROL_SESSION, FrameKind, Message};
use crate::socket::Socket;

/// Default locator endpoint.
pub const DEFAULT_LOCATOR_ENDPOINT: &str = "localhost:10053";

/// Network location of a resolved service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of a name resolution.
///
/// `success` stays false until at least one reply chunk decoded; when
/// several chunks decode, the last one wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveResult {
    pub endpoint: Endpoint,
    pub version: u64,
    pub api: HashMap<u64, String>,
    pub success: bool,
}

impl ResolveResult {
    // Reply chunks carry `[[host, port], version, {id: method}]`.
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value
            .as_array()
            .ok_or_else(|| malformed("resolve result is not an array"))?;
        let (endpoint, version, api) = match fields.as_slice() {
            [endpoint, version, api] => (endpoint, version, api),
            _ => return Err(malformed("resolve result does not have 3 elements")),
        };

        let endpoint = endpoint
            .as_array()
            .ok_or_else(|| malformed("endpoint is not an array"))?;
        let (host, port) = match endpoint.as_slice() {
            [host, port] => (host, port),
            _ => return Err(malformed("endpoint does not have 2 elements")),
        };
        let host = host
            .as_str()
            .ok_or_else(|| malformed("host is not a string"))?
            .to_owned();
        let port = port
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| malformed("port is not a valid u16"))?;

        let version = version
            .as_u64()
            .ok_or_else(|| malformed("version is not an unsigned integer"))?;

        let api = api
            .as_map()
            .ok_or_else(|| malformed("api is not a map"))?
            .iter()
            .map(|(id, method)| {
                let id = id
                    .as_u64()
                    .ok_or_else(|| malformed("method id is not an unsigned integer"))?;
                let method = method
                    .as_str()
                    .ok_or_else(|| malformed("method name is not a string"))?
                    .to_owned();
                Ok((id, method))
            })
            .collect::<Result<HashMap<_, _>, CodecError>>()?;

        Ok(Self {
            endpoint: Endpoint { host, port },
            version,
            api,
            success: false,
        })
    }
}

fn malformed(detail: &str) -> CodecError {
    CodecError::Malformed(detail.into())
}

/// Short-lived client for the locator service.
pub struct Locator {
    socket: Socket,
}

impl Locator {
    /// Connect to the default locator endpoint.
    pub async fn connect() -> io::Result<Self> {
        Self::connect_to(DEFAULT_LOCATOR_ENDPOINT).await
    }

    pub async fn connect_to(endpoint: &str) -> io::Result<Self> {
        Ok(Self::from_socket(Socket::connect_tcp(endpoint).await?))
    }

    /// Wrap an already-connected socket; useful for custom transports.
    pub fn from_socket(socket: Socket) -> Self {
        Self { socket }
    }

    /// Resolve `name` into an endpoint and method table.
    ///
    /// Returns a receiver that yields exactly one [`ResolveResult`] and is
    /// then closed; callers compose the timeout of their choice around it.
    /// Resolution is best-effort: chunks that fail to decode are skipped,
    /// and a connection that closes before any chunk decoded yields a result
    /// with `success == false`.
    pub fn resolve(self, name: &str) -> oneshot::Receiver<ResolveResult> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(resolve_task(self.socket, name.to_owned(), tx));
        rx
    }
}

async fn resolve_task(mut socket: Socket, name: String, out: oneshot::Sender<ResolveResult>) {
    let handle = socket.handle();
    handle.send(Message::invoke(CONTROL_SESSION, &name)).await;

    let mut result = ResolveResult::default();
    loop {
        let Some(message) = socket.recv().await else {
            tracing::debug!(%name, "locator connection closed before a terminator");
            break;
        };
        match message.frame_kind() {
            Some(FrameKind::Chunk) => {
                let Some(blob) = message.into_chunk_data() else {
                    tracing::warn!(%name, "resolve chunk without a data payload");
                    continue;
                };
                let mut reader: &[u8] = &blob;
                match rmpv::decode::read_value(&mut reader)
                    .map_err(|err| malformed(&err.to_string()))
                    .and_then(|value| ResolveResult::from_value(&value))
                {
                    Ok(decoded) => {
                        result = decoded;
                        result.success = true;
                    }
                    Err(err) => {
                        tracing::warn!(%name, %err, "skipping undecodable resolve chunk");
                    }
                }
            }
            Some(FrameKind::Choke) => break,
            _ => {
                tracing::debug!(%name, kind = message.kind, "ignoring frame during resolution");
            }
        }
    }

    handle.close().await;
    let _ = out.send(result);
}
