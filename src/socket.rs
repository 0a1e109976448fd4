//! Full-duplex framed-message pipe over a byte transport.
//!
//! A [`Socket`] wraps any in-order lossless byte stream and runs two
//! background tasks: a reader that reassembles bytes into [`Message`]s and a
//! writer that serialises queued messages in submission order. Everything
//! else in the crate talks to the transport through the inbound receiver and
//! a clone-able [`SocketHandle`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Unpacker};
use crate::error::Error;
use crate::message::Message;

const READ_CHUNK: usize = 8 * 1024;

/// Queue depths and timing knobs for a [`Socket`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Inbound message queue depth; a full queue backpressures the reader.
    pub read_queue_depth: usize,
    /// Outbound message queue depth.
    pub write_queue_depth: usize,
    /// How long `close` lets already-enqueued frames reach the wire.
    pub drain_grace: Duration,
    /// Connect timeout for [`Socket::connect_tcp`] / [`Socket::connect_unix`].
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_queue_depth: 64,
            write_queue_depth: 64,
            drain_grace: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
    drained: CancellationToken,
    error: Mutex<Option<Error>>,
}

impl Shared {
    fn record_error(&self, error: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

/// Clone-able handle to a socket's outbound half and close signal.
#[derive(Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

impl SocketHandle {
    /// Queue a message for the writer, guarded by the close signal: if the
    /// socket closes first the message is dropped. A dead transport never
    /// blocks the producer.
    pub async fn send(&self, message: Message) {
        tokio::select! {
            result = self.shared.outbound.send(message) => {
                if result.is_err() {
                    tracing::debug!("outbound queue gone; dropping frame");
                }
            }
            _ = self.shared.closed.cancelled() => {
                tracing::debug!("socket closed; dropping frame");
            }
        }
    }

    /// Resolves once the socket is closed, from either side, for any reason.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Shut both halves down. Idempotent. Already-enqueued frames are given
    /// the drain grace period to reach the wire; `close` returns once the
    /// drain has finished and the transport is released.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.drained.cancelled().await;
    }

    /// Take the error that tore this socket down, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.error.lock().take()
    }
}

/// A full-duplex framed-message pipe.
pub struct Socket {
    inbound: mpsc::Receiver<Message>,
    handle: SocketHandle,
}

impl Socket {
    /// Wrap an established byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(stream, SocketConfig::default())
    }

    pub fn with_config<S>(stream: S, config: SocketConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.read_queue_depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue_depth);
        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            closed: CancellationToken::new(),
            drained: CancellationToken::new(),
            error: Mutex::new(None),
        });

        tokio::spawn(read_loop(read_half, inbound_tx, shared.clone()));
        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            shared.clone(),
            config.drain_grace,
        ));

        Self {
            inbound: inbound_rx,
            handle: SocketHandle { shared },
        }
    }

    /// Connect to the runtime over a local stream socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: &str) -> io::Result<Self> {
        Self::connect_unix_with_config(path, SocketConfig::default()).await
    }

    #[cfg(unix)]
    pub async fn connect_unix_with_config(path: &str, config: SocketConfig) -> io::Result<Self> {
        let stream = connect_with_timeout(UnixStream::connect(path), config.connect_timeout).await?;
        Ok(Self::with_config(stream, config))
    }

    /// Connect over TCP, e.g. to the locator.
    pub async fn connect_tcp(addr: &str) -> io::Result<Self> {
        Self::connect_tcp_with_config(addr, SocketConfig::default()).await
    }

    pub async fn connect_tcp_with_config(addr: &str, config: SocketConfig) -> io::Result<Self> {
        let stream =
            connect_with_timeout(TcpStream::connect(addr), config.connect_timeout).await?;
        Ok(Self::with_config(stream, config))
    }

    /// Next inbound message, in arrival order. `None` once the peer
    /// half-closed or the socket was closed locally and the queue is empty.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Without a receiver the background tasks have no one to serve.
        self.handle.shared.closed.cancel();
    }
}

async fn connect_with_timeout<F, S>(connect: F, limit: Duration) -> io::Result<S>
where
    F: std::future::Future<Output = io::Result<S>>,
{
    match tokio::time::timeout(limit, connect).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

async fn read_loop<R>(mut read: R, inbound: mpsc::Sender<Message>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut unpacker = Unpacker::new();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    'read: loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break 'read,
            result = read.read_buf(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("peer closed the connection");
                    break 'read;
                }
                Ok(_) => {
                    let messages = match unpacker.feed(&buf) {
                        Ok(messages) => messages,
                        Err(err) => {
                            tracing::error!(%err, "abandoning connection on malformed frame");
                            shared.record_error(Error::Codec(err));
                            break 'read;
                        }
                    };
                    buf.clear();
                    for message in messages {
                        tokio::select! {
                            result = inbound.send(message) => {
                                if result.is_err() {
                                    break 'read;
                                }
                            }
                            _ = shared.closed.cancelled() => break 'read,
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "read failed");
                    shared.record_error(Error::Io(err));
                    break 'read;
                }
            },
        }
    }
    shared.closed.cancel();
    // Dropping `inbound` ends the read channel once buffered messages drain.
}

async fn write_loop<W>(
    mut write: W,
    mut outbound: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    grace: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = outbound.recv() => match next {
                Some(message) => {
                    if let Err(err) = write_message(&mut write, &message).await {
                        tracing::debug!(%err, "write failed");
                        shared.record_error(Error::Io(err));
                        shared.closed.cancel();
                        shared.drained.cancel();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // Give frames enqueued before the close a chance to reach the wire.
    let drain = async {
        while let Ok(message) = outbound.try_recv() {
            if write_message(&mut write, &message).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("drain grace elapsed with frames still queued");
    }

    shared.closed.cancel();
    shared.drained.cancel();
}

async fn write_message<W>(write: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec::encode(message);
    write.write_all(&bytes).await?;
    write.flush().await
}
