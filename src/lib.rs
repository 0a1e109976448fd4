//! tether: worker-side runtime for a distributed service-dispatch platform.
//!
//! A controller process (the runtime) spawns worker processes and streams
//! invocation requests to them over a local transport, expecting streamed
//! replies. This crate is the worker's endpoint of that protocol:
//!
//! - Framed message codec and stream reassembler ([`Unpacker`], [`Message`])
//! - Full-duplex socket abstraction ([`Socket`], [`SocketHandle`])
//! - Per-invocation request/response streams ([`Request`], [`Response`])
//! - The worker event loop with its heartbeat/disown state machine
//!   ([`Worker`])
//! - The locator client ([`Locator`])
//!
//! # Usage
//!
//! ```ignore
//! let socket = Socket::connect_unix(&endpoint).await?;
//! let mut worker = Worker::new(socket, worker_id);
//! worker.on("echo", |mut request, response| async move {
//!     if let Ok(data) = request.read(None).await {
//!         response.write(data).await;
//!     }
//!     response.close().await;
//! });
//! worker.run().await?;
//! ```
//!
//! The worker id and endpoint are supplied by the invocation environment
//! (typically command-line flags handed to the worker binary by the
//! supervising runtime); the crate takes them directly. A worker whose
//! `run` returns [`Error::Disowned`] should exit non-zero so the supervisor
//! restarts it.

#![forbid(unsafe_code)]

mod codec;
mod error;
mod locator;
mod message;
mod socket;
mod streams;
mod worker;

pub use codec::*;
pub use error::*;
pub use locator::*;
pub use message::*;
pub use socket::*;
pub use streams::*;
pub use worker::*;
