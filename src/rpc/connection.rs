use super::{
    wire::{self, Frame},
    Config, Error,
};
use bytes::Bytes;
use futures::{channel::oneshot, future::BoxFuture, FutureExt};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as SyncMutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{Mutex, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

type HandlerFuture = BoxFuture<'static, Result<Bytes, String>>;
type Handler = Box<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

/// Handlers for incoming calls, keyed by operation name. Populated before
/// the connection starts; the dispatcher only reads it.
#[derive(Default)]
pub struct Handlers {
    entries: HashMap<String, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for calls naming `op`.
    ///
    /// # Panics
    ///
    /// Panics if `op` is empty, longer than 255 bytes, or already
    /// registered; handler wiring is startup configuration, not runtime
    /// input.
    pub fn register<F, Fut>(&mut self, op: &str, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, String>> + Send + 'static,
    {
        assert!(
            !op.is_empty() && op.len() <= u8::MAX as usize,
            "operation name must be 1..=255 bytes"
        );
        let previous = self
            .entries
            .insert(op.to_string(), Box::new(move |payload| handler(payload).boxed()));
        assert!(previous.is_none(), "handler already registered: {op}");
    }

    fn get(&self, op: &str) -> Option<&Handler> {
        self.entries.get(op)
    }
}

/// The result routed from the dispatcher back to the caller blocked in
/// [Connection::call]: reply status and payload, or the terminal error.
type Reply = Result<(u8, Bytes), Error>;

struct Metrics {
    sent: Counter,
    received: Counter,
    calls: Counter,
}

impl Metrics {
    fn register(registry: &mut Registry) -> Self {
        let metrics = Self {
            sent: Counter::default(),
            received: Counter::default(),
            calls: Counter::default(),
        };
        registry.register(
            "messages_sent",
            "Frames written to the connection",
            metrics.sent.clone(),
        );
        registry.register(
            "messages_received",
            "Frames read from the connection",
            metrics.received.clone(),
        );
        registry.register(
            "calls",
            "Calls issued on the connection",
            metrics.calls.clone(),
        );
        metrics
    }
}

/// State shared between the caller-facing handle and the dispatcher task.
struct Shared {
    sender: u64,
    max_message_size: usize,
    send_timeout: Duration,

    /// Serializes byte-level frame writes only; held for the duration of
    /// one `write_all`, never across a round trip.
    sink: Mutex<OwnedWriteHalf>,

    /// The reply slot of the one outstanding call, if any.
    pending: SyncMutex<Option<oneshot::Sender<Reply>>>,

    connected: AtomicBool,
    metrics: Metrics,
}

impl Shared {
    /// Write one frame. Frames from concurrent senders (a caller and the
    /// dispatcher replying) interleave at frame granularity, never within
    /// a frame.
    async fn send_frame(&self, frame: Frame) -> Result<(), Error> {
        if frame.body_len() > self.max_message_size {
            return Err(Error::TooLarge(frame.body_len()));
        }
        let buf = frame.encode();
        let mut sink = timeout(self.send_timeout, self.sink.lock())
            .await
            .map_err(|_| Error::Timeout)?;
        timeout(self.send_timeout, sink.write_all(&buf))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::SendFailed)?;
        self.metrics.sent.inc();
        Ok(())
    }

    /// Mark the connection closed and fail the outstanding call, if any.
    fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.pending.lock().unwrap().take() {
            let _ = tx.send(Err(Error::Closed));
        }
    }
}

/// One long-lived duplex connection to a peer.
///
/// The connection owns exactly one dispatcher task, which owns the
/// receive path: it reads one frame at a time, routes `Call` frames to
/// the registered handler (sending the handler's reply back), and routes
/// `Reply` frames to the caller blocked in [Connection::call]. The task
/// exits when the peer disconnects, when a frame fails validation, or
/// when [Connection::close] aborts it; the handle owns the task and
/// reaps it deterministically on drop.
pub struct Connection {
    shared: Arc<Shared>,
    /// Held across a whole call round trip: at most one outstanding call
    /// from this side at a time.
    calls: Arc<Semaphore>,
    dispatcher: SyncMutex<Option<JoinHandle<()>>>,
    call_timeout: Option<Duration>,
}

impl Connection {
    /// Take ownership of an established stream and start dispatching.
    pub fn start(
        cfg: Config,
        registry: &mut Registry,
        stream: TcpStream,
        handlers: Handlers,
    ) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            warn!(?err, "failed to set TCP_NODELAY");
        }
        let (read, write) = stream.into_split();
        let shared = Arc::new(Shared {
            sender: cfg.sender,
            max_message_size: cfg.max_message_size,
            send_timeout: cfg.send_timeout,
            sink: Mutex::new(write),
            pending: SyncMutex::new(None),
            connected: AtomicBool::new(true),
            metrics: Metrics::register(registry),
        });
        let dispatcher = tokio::spawn(Self::dispatch(
            shared.clone(),
            BufReader::new(read),
            Arc::new(handlers),
        ));
        Self {
            shared,
            calls: Arc::new(Semaphore::new(1)),
            dispatcher: SyncMutex::new(Some(dispatcher)),
            call_timeout: cfg.call_timeout,
        }
    }

    /// Dial `addr` and start dispatching.
    pub async fn dial(
        cfg: Config,
        registry: &mut Registry,
        addr: SocketAddr,
        handlers: Handlers,
    ) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| Error::ConnectionFailed)?;
        Ok(Self::start(cfg, registry, stream, handlers))
    }

    /// The receive loop. Exactly one per connection.
    async fn dispatch(
        shared: Arc<Shared>,
        mut stream: BufReader<OwnedReadHalf>,
        handlers: Arc<Handlers>,
    ) {
        loop {
            // A failed or zero-length read is a peer disconnect, not a
            // fault: mark the connection closed and stop.
            let mut prefix = [0u8; 4];
            if let Err(err) = stream.read_exact(&mut prefix).await {
                debug!(?err, "peer disconnected");
                break;
            }
            let len = u32::from_be_bytes(prefix) as usize;
            if len == 0 || len > shared.max_message_size {
                warn!(len, "frame length out of bounds");
                break;
            }
            let mut body = vec![0u8; len];
            if let Err(err) = stream.read_exact(&mut body).await {
                debug!(?err, "peer disconnected mid-frame");
                break;
            }
            shared.metrics.received.inc();

            match Frame::decode(Bytes::from(body)) {
                Ok(Frame::Call { op, payload, .. }) => {
                    let (status, payload) = match handlers.get(&op) {
                        Some(handler) => match handler(payload).await {
                            Ok(reply) => (wire::STATUS_OK, reply),
                            Err(err) => (wire::STATUS_ERROR, Bytes::from(err.into_bytes())),
                        },
                        None => {
                            debug!(op = %op, "call names no registered handler");
                            (wire::STATUS_UNKNOWN_OP, Bytes::from(op.clone().into_bytes()))
                        }
                    };
                    let reply = Frame::Reply {
                        sender: shared.sender,
                        status,
                        payload,
                    };
                    if let Err(err) = shared.send_frame(reply).await {
                        warn!(?err, "failed to send reply");
                        break;
                    }
                }
                Ok(Frame::Reply {
                    status, payload, ..
                }) => {
                    let Some(tx) = shared.pending.lock().unwrap().take() else {
                        warn!("reply with no outstanding call");
                        break;
                    };
                    let _ = tx.send(Ok((status, payload)));
                }
                Err(err) => {
                    warn!(?err, "invalid frame");
                    break;
                }
            }
        }
        shared.teardown();
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Issue a synchronous call: send `payload` under `op` and block until
    /// the peer's reply arrives.
    ///
    /// Calls are half-duplex: a second call from this side waits until the
    /// first call's reply has been fully dispatched. A call that times out
    /// tears the connection down before returning [Error::Timeout], so a
    /// timed-out connection is never left half-open.
    pub async fn call(&self, op: &str, payload: Bytes) -> Result<Bytes, Error> {
        if !self.is_connected() {
            return Err(Error::Closed);
        }
        let permit = timeout(self.shared.send_timeout, self.calls.clone().acquire_owned())
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Closed)?;
        if !self.is_connected() {
            return Err(Error::Closed);
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock().unwrap() = Some(tx);
        let frame = Frame::Call {
            sender: self.shared.sender,
            op: op.to_string(),
            payload,
        };
        if let Err(err) = self.shared.send_frame(frame).await {
            self.shared.pending.lock().unwrap().take();
            if !matches!(err, Error::TooLarge(_)) {
                // The socket state is unknown: tear down.
                self.close();
            }
            return Err(err);
        }
        self.shared.metrics.calls.inc();

        let reply = match self.call_timeout {
            Some(wait) => match timeout(wait, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    drop(permit);
                    self.close();
                    return Err(Error::Timeout);
                }
            },
            // No deadline: used in debug sessions where a break-in should
            // not be cut short by an artificial timeout.
            None => rx.await,
        };
        drop(permit);

        match reply {
            Ok(Ok((wire::STATUS_OK, payload))) => Ok(payload),
            Ok(Ok((wire::STATUS_UNKNOWN_OP, payload))) => Err(Error::UnknownOperation(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            Ok(Ok((_, payload))) => {
                Err(Error::Remote(String::from_utf8_lossy(&payload).into_owned()))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Tear the connection down: abort the dispatcher, fail the
    /// outstanding call, and refuse further operations.
    pub fn close(&self) {
        self.shared.teardown();
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
