//! Per-invocation request and response streams.
//!
//! Each in-flight session pairs a [`Request`] (the handler's inbox, fed by
//! the worker loop in wire order) with a [`Response`] (a write-only handle
//! that serialises onto the worker's shared outbound channel).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::message::Message;
use crate::socket::SocketHandle;

/// Inbound side of one session: a finite, single-consumer queue of request
/// payloads.
pub struct Request {
    payloads: mpsc::Receiver<Bytes>,
}

impl Request {
    pub(crate) fn channel(depth: usize) -> (mpsc::Sender<Bytes>, Request) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, Request { payloads: rx })
    }

    /// Next payload in wire-arrival order.
    ///
    /// Blocks until a payload is available, the optional `timeout` elapses
    /// ([`Error::Timeout`]), or the stream terminates
    /// ([`Error::StreamClosed`]): either its terminator frame arrived or the
    /// worker shut down.
    pub async fn read(&mut self, timeout: Option<Duration>) -> Result<Bytes, Error> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.payloads.recv()).await {
                Ok(Some(data)) => Ok(data),
                Ok(None) => Err(Error::StreamClosed),
                Err(_) => Err(Error::Timeout),
            },
            None => self.payloads.recv().await.ok_or(Error::StreamClosed),
        }
    }
}

struct ResponseInner {
    session: u64,
    to_worker: mpsc::Sender<Message>,
    socket: SocketHandle,
    finished: AtomicBool,
}

/// Outbound side of one session.
///
/// Clones refer to the same session. `error_msg` and `close` finish the
/// session; afterwards every operation is a silent no-op.
#[derive(Clone)]
pub struct Response {
    inner: Arc<ResponseInner>,
}

impl Response {
    pub(crate) fn new(session: u64, to_worker: mpsc::Sender<Message>, socket: SocketHandle) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                session,
                to_worker,
                socket,
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Send one chunk of reply data.
    pub async fn write(&self, data: impl Into<Vec<u8>>) {
        if self.inner.finished.load(Ordering::Acquire) {
            return;
        }
        self.send(Message::chunk(self.inner.session, data.into())).await;
    }

    /// Report a session error, then finish the session.
    pub async fn error_msg(&self, code: i64, text: &str) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send(Message::error(self.inner.session, code, text)).await;
        self.send(Message::choke(self.inner.session)).await;
    }

    /// Finish the session.
    pub async fn close(&self) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send(Message::choke(self.inner.session)).await;
    }

    // Guarded send: a dead worker or socket never blocks the handler.
    async fn send(&self, message: Message) {
        tokio::select! {
            result = self.inner.to_worker.send(message) => {
                if result.is_err() {
                    tracing::debug!(session = self.inner.session, "worker gone; dropping frame");
                }
            }
            _ = self.inner.socket.closed() => {
                tracing::debug!(session = self.inner.session, "socket closed; dropping frame");
            }
        }
    }
}
