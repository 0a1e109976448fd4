//! The worker event loop.
//!
//! A single cooperative selector owns the socket's inbound half, the session
//! table and both keep-alive timers. Inbound frames are demultiplexed to
//! per-session request streams; each invocation runs its handler on its own
//! task, and everything the handlers produce funnels back through one shared
//! outbound channel.
//!
//! # Heartbeat / disown
//!
//! The worker emits a heartbeat every `heartbeat_interval` and expects the
//! runtime to reply within `disown_timeout`. A reply disarms the deadline;
//! a missed deadline means the runtime has gone silent, and the worker exits
//! with [`Error::Disowned`] so the supervisor can restart it.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::message::{FrameKind, Message};
use crate::socket::{Socket, SocketHandle};
use crate::streams::{Request, Response};

/// Error code reported when a handler panics.
pub const ERROR_PANIC_IN_HANDLER: i64 = 100;
/// Error code reported when no handler is registered for an event.
pub const ERROR_NO_EVENT_HANDLER: i64 = 200;

/// Boxed future returned by event handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler for one invocation: consumes the request stream and replies on
/// the response stream.
pub type EventHandler = Box<dyn Fn(Request, Response) -> BoxFuture<()> + Send + Sync>;

/// Handler invoked when no [`EventHandler`] matches; additionally receives
/// the event name.
pub type FallbackHandler = Box<dyn Fn(String, Request, Response) -> BoxFuture<()> + Send + Sync>;

/// Timing and queue-depth knobs for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Deadline for the runtime's heartbeat reply.
    pub disown_timeout: Duration,
    /// Depth of each session's inbound request queue. Chunks arriving for a
    /// session whose handler has stopped draining are dropped with a warning
    /// once the queue fills; a stalled handler must not wedge the selector.
    pub request_queue_depth: usize,
    /// Depth of the shared handler-to-worker outbound queue.
    pub response_queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            disown_timeout: Duration::from_secs(5),
            request_queue_depth: 128,
            response_queue_depth: 64,
        }
    }
}

/// Clone-able stop lever for a running [`Worker`].
#[derive(Clone)]
pub struct Stopper {
    stop: CancellationToken,
    socket: SocketHandle,
}

impl Stopper {
    /// Request shutdown and close the connection.
    ///
    /// Idempotent and asynchronous: callers that need synchronous teardown
    /// await [`Worker::run`]'s return instead.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.socket.close().await;
    }
}

/// The worker-side endpoint of the dispatch protocol.
pub struct Worker {
    socket: Socket,
    id: String,
    config: WorkerConfig,
    handlers: HashMap<String, EventHandler>,
    fallback: FallbackHandler,
    sessions: HashMap<u64, mpsc::Sender<Bytes>>,
    from_handlers_tx: mpsc::Sender<Message>,
    from_handlers_rx: mpsc::Receiver<Message>,
    stop: CancellationToken,
}

impl Worker {
    /// Create a worker over an established connection, introducing itself
    /// with `id`.
    pub fn new(socket: Socket, id: impl Into<String>) -> Self {
        Self::with_config(socket, id, WorkerConfig::default())
    }

    pub fn with_config(socket: Socket, id: impl Into<String>, config: WorkerConfig) -> Self {
        let (from_handlers_tx, from_handlers_rx) = mpsc::channel(config.response_queue_depth);
        Self {
            socket,
            id: id.into(),
            config,
            handlers: HashMap::new(),
            fallback: Box::new(|event, request, response| {
                Box::pin(default_fallback(event, request, response))
            }),
            sessions: HashMap::new(),
            from_handlers_tx,
            from_handlers_rx,
            stop: CancellationToken::new(),
        }
    }

    /// Bind `handler` for `event`.
    pub fn on<F, Fut>(&mut self, event: impl Into<String>, handler: F)
    where
        F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            event.into(),
            Box::new(move |request, response| Box::pin(handler(request, response))),
        );
    }

    /// Replace the handler used when no event matches.
    pub fn set_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(String, Request, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.fallback = Box::new(move |event, request, response| {
            Box::pin(handler(event, request, response))
        });
    }

    /// A stop lever usable from any task.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            stop: self.stop.clone(),
            socket: self.socket.handle(),
        }
    }

    /// Announce the worker to the runtime and dispatch invocations until
    /// stopped.
    ///
    /// Returns `Ok(())` after a clean stop (local [`Stopper::stop`] or a
    /// `terminate` from the runtime), [`Error::Disowned`] when the runtime
    /// goes silent, or the transport error that tore the connection down.
    pub async fn run(mut self) -> Result<(), Error> {
        let handle = self.socket.handle();

        // Handshake first; nothing else may precede it on the wire.
        handle.send(Message::handshake(&self.id)).await;

        let heartbeat = sleep(self.config.heartbeat_interval);
        let disown = sleep(self.config.disown_timeout);
        tokio::pin!(heartbeat, disown);

        // The first heartbeat announces readiness and arms both timers.
        handle.send(Message::heartbeat()).await;
        heartbeat
            .as_mut()
            .reset(Instant::now() + self.config.heartbeat_interval);
        disown
            .as_mut()
            .reset(Instant::now() + self.config.disown_timeout);
        let mut disown_armed = true;

        let mut inbound_open = true;
        let mut exit: Result<(), Error> = Ok(());

        loop {
            tokio::select! {
                inbound = self.socket.recv(), if inbound_open => match inbound {
                    Some(message) => match message.frame_kind() {
                        Some(FrameKind::Heartbeat) => {
                            tracing::debug!("heartbeat reply received");
                            disown_armed = false;
                        }
                        Some(FrameKind::Terminate) => {
                            let (code, reason) = message.terminate_info();
                            tracing::info!(code, reason, "terminate received from the runtime");
                            self.stop.cancel();
                            handle.close().await;
                        }
                        _ => self.on_frame(message, &handle),
                    },
                    None => {
                        inbound_open = false;
                        if !self.stop.is_cancelled() {
                            exit = Err(handle.take_error().unwrap_or(Error::ConnectionLost));
                            self.stop.cancel();
                            handle.close().await;
                        }
                    }
                },
                _ = &mut heartbeat => {
                    handle.send(Message::heartbeat()).await;
                    heartbeat
                        .as_mut()
                        .reset(Instant::now() + self.config.heartbeat_interval);
                    disown
                        .as_mut()
                        .reset(Instant::now() + self.config.disown_timeout);
                    disown_armed = true;
                }
                _ = &mut disown, if disown_armed => {
                    disown_armed = false;
                    tracing::error!("no heartbeat reply within the disown timeout; exiting");
                    exit = Err(Error::Disowned);
                    self.stop.cancel();
                    handle.close().await;
                }
                Some(outgoing) = self.from_handlers_rx.recv() => {
                    // Guarded internally against a dead transport.
                    handle.send(outgoing).await;
                }
                _ = self.stop.cancelled() => {
                    return exit;
                }
            }
        }
    }

    fn on_frame(&mut self, message: Message, handle: &SocketHandle) {
        match message.frame_kind() {
            Some(FrameKind::Invoke) => self.on_invoke(message, handle),
            Some(FrameKind::Chunk) => self.on_chunk(message),
            Some(FrameKind::Choke) => {
                // Dropping the sender wakes the handler with end-of-stream.
                self.sessions.remove(&message.session);
            }
            _ => {
                tracing::warn!(
                    kind = message.kind,
                    session = message.session,
                    "dropping unexpected frame"
                );
            }
        }
    }

    fn on_invoke(&mut self, message: Message, handle: &SocketHandle) {
        let session = message.session;
        let Some(event) = message.event_name().map(str::to_owned) else {
            tracing::warn!(session, "invoke frame without an event name");
            return;
        };
        if self.sessions.contains_key(&session) {
            tracing::warn!(session, %event, "duplicate invoke for a live session");
            return;
        }

        let response = Response::new(session, self.from_handlers_tx.clone(), handle.clone());
        let (push, request) = Request::channel(self.config.request_queue_depth);
        self.sessions.insert(session, push);

        let task = match self.handlers.get(&event) {
            Some(handler) => handler(request, response.clone()),
            None => {
                tracing::debug!(session, %event, "no handler; dispatching to fallback");
                (self.fallback)(event.clone(), request, response.clone())
            }
        };
        tokio::spawn(trap_panics(event, response, task));
    }

    fn on_chunk(&mut self, message: Message) {
        let session = message.session;
        let Some(queue) = self.sessions.get(&session) else {
            // Unknown session: drop.
            return;
        };
        let Some(data) = message.into_chunk_data() else {
            tracing::warn!(session, "chunk frame without a data payload");
            return;
        };
        match queue.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session, "request queue full; dropping chunk");
            }
            // The handler finished reading; late chunks are fine to drop.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// The default fallback: report that the event has no handler.
async fn default_fallback(event: String, _request: Request, response: Response) {
    let text = format!("There is no handler for event {event}");
    response.error_msg(ERROR_NO_EVENT_HANDLER, &text).await;
}

/// Convert an uncaught handler panic into a well-formed protocol error on
/// the session, leaving the worker itself untouched.
async fn trap_panics(event: String, response: Response, task: BoxFuture<()>) {
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        let detail = if let Some(text) = panic.downcast_ref::<&str>() {
            (*text).to_owned()
        } else if let Some(text) = panic.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic".to_owned()
        };
        tracing::error!(%event, %detail, "handler panicked");
        let text = format!("error in event '{event}': {detail}");
        response.error_msg(ERROR_PANIC_IN_HANDLER, &text).await;
    }
}
