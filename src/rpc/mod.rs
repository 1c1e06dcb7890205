//! Framed request/dispatch/reply over a long-lived TCP connection.
//!
//! A [Connection] wraps one established stream. Exactly one dispatcher
//! task per connection owns the receive path: it reads length-prefixed
//! frames, routes incoming `Call` frames to the handler registered for
//! the named operation (writing the handler's reply back on the shared
//! send path), and routes incoming `Reply` frames to the caller blocked
//! in [Connection::call]. Peer disconnect is an expected state
//! transition, not a fault: the dispatcher marks the connection closed
//! and exits, and later operations fail with [Error::Closed].
//!
//! Calls from one side are half-duplex: at most one call is outstanding
//! at a time, and a second caller waits until the first reply has been
//! dispatched. Byte-level frame writes are serialized separately (and
//! briefly), so the dispatcher can always answer the peer's calls even
//! while a local call is waiting for its reply; two peers calling each
//! other simultaneously make progress.
//!
//! Handlers run on the dispatcher task itself: while one executes, no
//! further frames are read. A handler must therefore never issue a call
//! on its own connection (the reply could not be dispatched until the
//! handler returns).
//!
//! The payload encoding is the caller's business; this module fixes only
//! the framing and dispatch contract. Frames bigger than
//! [Config::max_message_size] are refused on send and treated as a
//! protocol violation on receive.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use pagecache::rpc::{Config, Connection, Handlers};
//! use prometheus_client::registry::Registry;
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
//!     let addr = listener.local_addr().unwrap();
//!
//!     let mut handlers = Handlers::new();
//!     handlers.register("echo", |payload: Bytes| async move { Ok(payload) });
//!     let server = tokio::spawn(async move {
//!         let (stream, _) = listener.accept().await.unwrap();
//!         let mut registry = Registry::default();
//!         Connection::start(Config::new(1), &mut registry, stream, handlers)
//!     });
//!
//!     let mut registry = Registry::default();
//!     let client = Connection::dial(Config::new(2), &mut registry, addr, Handlers::new())
//!         .await
//!         .unwrap();
//!     let _server = server.await.unwrap();
//!
//!     let reply = client.call("echo", Bytes::from_static(b"hi")).await.unwrap();
//!     assert_eq!(&reply[..], b"hi");
//! });
//! ```

use std::time::Duration;
use thiserror::Error;

mod connection;
mod wire;

pub use connection::{Connection, Handlers};

/// Default largest frame body accepted or produced (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default bound on one call round trip (30 s).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on acquiring the send path and writing one frame (10 s).
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when interacting with a [Connection].
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection closed")]
    Closed,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("timed out")]
    Timeout,
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    #[error("invalid frame")]
    InvalidFrame,
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("send failed")]
    SendFailed,
}

/// Configuration for a [Connection].
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity written into every frame this side sends.
    pub sender: u64,

    /// Largest frame body this side will send or accept.
    pub max_message_size: usize,

    /// Bound on one call round trip. `None` waits forever (useful under a
    /// debugger, where a break-in would otherwise trip the timeout).
    pub call_timeout: Option<Duration>,

    /// Bound on acquiring the send path and writing one frame.
    pub send_timeout: Duration,
}

impl Config {
    pub fn new(sender: u64) -> Self {
        Self {
            sender,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// See [Config::max_message_size].
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// See [Config::call_timeout].
    pub fn with_call_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// See [Config::send_timeout].
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }
}
