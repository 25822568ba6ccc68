// src/live_query/transport.rs

//! WebSocket transport for the LiveQuery client.
//!
//! The socket itself sits behind the [`SocketConnector`], [`SocketWriter`] and
//! [`SocketReader`] traits so tests can swap in an in-memory server. Every connected
//! socket gets a [`SocketId`] from a [`SocketPool`], which owns two maps shared by all
//! clients using the pool:
//! - socket → delegate: who receives the socket's frames
//! - socket → is-receiving: whether frames from the socket are still wanted
//!
//! A socket stops receiving as soon as its client lets go of it and is detached once
//! its close handshake is over. Either way its reader task stops delivering, so a
//! replaced socket can never feed stale frames into the client.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::ParseError;

/// Boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, ParseError>;

/// Identifies one socket within a [`SocketPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

/// Something that arrived on a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A text frame.
    Message(String),
    Pong,
    /// The peer closed the socket or the stream ended.
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// The socket failed; no further frames will arrive.
    Error(String),
}

impl SocketEvent {
    fn ends_socket(&self) -> bool {
        matches!(self, SocketEvent::Closed { .. } | SocketEvent::Error(_))
    }
}

/// Opens sockets.
pub trait SocketConnector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, TransportResult<SocketParts>>;
}

/// Write half of a socket.
pub trait SocketWriter: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>>;

    fn send_ping(&mut self) -> BoxFuture<'_, TransportResult<()>>;

    fn close(
        &mut self,
        code: Option<u16>,
        reason: Option<String>,
    ) -> BoxFuture<'_, TransportResult<()>>;
}

/// Read half of a socket.
pub trait SocketReader: Send {
    /// Returns `None` once the stream has ended.
    fn next_event(&mut self) -> BoxFuture<'_, Option<SocketEvent>>;
}

/// The two halves of a freshly connected socket.
pub struct SocketParts {
    pub writer: Box<dyn SocketWriter>,
    pub reader: Box<dyn SocketReader>,
}

/// Receives the frames of the sockets it was attached with.
pub trait SocketDelegate: Send + Sync {
    fn socket_event(&self, socket: SocketId, event: SocketEvent);
}

enum Outbound {
    Text(String),
    Ping(oneshot::Sender<TransportResult<()>>),
    Close {
        code: Option<u16>,
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
}

/// Sending side of an attached socket.
///
/// Frames are queued to a writer task, so they leave in the order they were queued and
/// sending never blocks the caller.
#[derive(Clone)]
pub struct SocketHandle {
    id: SocketId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SocketHandle {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn send_text(&self, text: String) -> TransportResult<()> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| ParseError::NotConnected)
    }

    /// Resolves once the ping frame was written (or failed to be).
    pub async fn ping(&self) -> TransportResult<()> {
        let (done, result) = oneshot::channel();
        self.outbound
            .send(Outbound::Ping(done))
            .map_err(|_| ParseError::NotConnected)?;
        result.await.map_err(|_| ParseError::NotConnected)?
    }

    /// Starts the close handshake and waits for it, at most `grace`.
    pub async fn close(&self, code: Option<u16>, reason: Option<String>, grace: Duration) {
        let (done, finished) = oneshot::channel();
        if self
            .outbound
            .send(Outbound::Close { code, reason, done })
            .is_err()
        {
            return;
        }
        if tokio::time::timeout(grace, finished).await.is_err() {
            log::warn!(
                "LiveQuery socket {:?} did not finish closing within {:?}",
                self.id,
                grace
            );
        }
    }
}

#[derive(Default)]
struct PoolInner {
    next_id: AtomicU64,
    delegates: Mutex<HashMap<SocketId, Weak<dyn SocketDelegate>>>,
    receiving: Mutex<HashMap<SocketId, bool>>,
}

/// Tracks every live socket and who receives its frames.
///
/// Cloning is cheap; clones share the same maps. Several clients may share one pool.
#[derive(Clone, Default)]
pub struct SocketPool {
    inner: Arc<PoolInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connected socket, starts its reader and writer tasks and returns
    /// the handle used to send on it. Must be called within a tokio runtime.
    pub fn attach(&self, parts: SocketParts, delegate: Weak<dyn SocketDelegate>) -> SocketHandle {
        let id = SocketId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.inner.delegates).insert(id, delegate);
        lock(&self.inner.receiving).insert(id, true);

        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(self.clone(), id, parts.writer, queue));
        tokio::spawn(receive_loop(self.clone(), id, parts.reader));

        log::debug!("Attached LiveQuery socket {:?}", id);
        SocketHandle { id, outbound }
    }

    /// Forgets a socket. Frames it still produces are dropped.
    pub fn detach(&self, id: SocketId) {
        lock(&self.inner.delegates).remove(&id);
        lock(&self.inner.receiving).remove(&id);
        log::debug!("Detached LiveQuery socket {:?}", id);
    }

    pub fn is_receiving(&self, id: SocketId) -> bool {
        lock(&self.inner.receiving)
            .get(&id)
            .copied()
            .unwrap_or(false)
    }

    /// Stops (or resumes) delivery of the socket's frames without detaching it.
    pub fn set_receiving(&self, id: SocketId, receiving: bool) {
        if let Some(flag) = lock(&self.inner.receiving).get_mut(&id) {
            *flag = receiving;
        }
    }

    /// Closes a socket: its frames stop being delivered right away, and it stays
    /// attached until the close handshake finished or `grace` ran out.
    pub async fn close(
        &self,
        socket: SocketHandle,
        code: Option<u16>,
        reason: Option<String>,
        grace: Duration,
    ) {
        let id = socket.id();
        self.set_receiving(id, false);
        socket.close(code, reason, grace).await;
        self.detach(id);
    }

    pub fn is_attached(&self, id: SocketId) -> bool {
        lock(&self.inner.delegates).contains_key(&id)
    }

    /// Number of sockets currently attached.
    pub fn len(&self) -> usize {
        lock(&self.inner.delegates).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands `event` to the socket's delegate. Returns `false` when the socket is no
    /// longer attached or receiving, or its delegate is gone.
    pub fn dispatch(&self, id: SocketId, event: SocketEvent) -> bool {
        if !self.is_receiving(id) {
            return false;
        }
        let delegate = lock(&self.inner.delegates)
            .get(&id)
            .and_then(|delegate| delegate.upgrade());
        match delegate {
            Some(delegate) => {
                delegate.socket_event(id, event);
                true
            }
            None => false,
        }
    }
}

async fn receive_loop(pool: SocketPool, id: SocketId, mut reader: Box<dyn SocketReader>) {
    loop {
        let event = reader.next_event().await.unwrap_or(SocketEvent::Closed {
            code: None,
            reason: None,
        });
        let ends_socket = event.ends_socket();
        if !pool.dispatch(id, event) {
            log::debug!("Dropping frame from stale LiveQuery socket {:?}", id);
            break;
        }
        if ends_socket {
            break;
        }
    }
}

async fn write_loop(
    pool: SocketPool,
    id: SocketId,
    mut writer: Box<dyn SocketWriter>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut closed = false;
    while let Some(outbound) = queue.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(e) = writer.send_text(text).await {
                    log::warn!("LiveQuery socket {:?} failed to send: {}", id, e);
                    pool.dispatch(id, SocketEvent::Error(e.to_string()));
                    break;
                }
            }
            Outbound::Ping(done) => {
                let _ = done.send(writer.send_ping().await);
            }
            Outbound::Close { code, reason, done } => {
                if let Err(e) = writer.close(code, reason).await {
                    log::debug!("LiveQuery socket {:?} close handshake failed: {}", id, e);
                }
                let _ = done.send(());
                closed = true;
                break;
            }
        }
    }
    // Every handle was dropped without closing the socket.
    if !closed {
        let _ = writer.close(None, None).await;
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector built on `tokio-tungstenite`.
///
/// `wss://` URLs need one of the crate's TLS features.
#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        TungsteniteConnector
    }
}

impl SocketConnector for TungsteniteConnector {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, TransportResult<SocketParts>> {
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ParseError::ConnectionFailed(e.to_string()))?;

            let (sink, stream) = ws_stream.split();
            Ok(SocketParts {
                writer: Box::new(TungsteniteWriter { sink }),
                reader: Box::new(TungsteniteReader { stream }),
            })
        })
    }
}

struct TungsteniteWriter {
    sink: SplitSink<WsStream, Message>,
}

impl SocketWriter for TungsteniteWriter {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| ParseError::TransportError(e.to_string()))
        })
    }

    fn send_ping(&mut self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Ping(Vec::new().into()))
                .await
                .map_err(|e| ParseError::TransportError(e.to_string()))
        })
    }

    fn close(
        &mut self,
        code: Option<u16>,
        reason: Option<String>,
    ) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let frame = code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.unwrap_or_default().into(),
            });
            self.sink
                .send(Message::Close(frame))
                .await
                .map_err(|e| ParseError::TransportError(e.to_string()))?;
            self.sink
                .close()
                .await
                .map_err(|e| ParseError::TransportError(e.to_string()))
        })
    }
}

struct TungsteniteReader {
    stream: SplitStream<WsStream>,
}

impl SocketReader for TungsteniteReader {
    fn next_event(&mut self) -> BoxFuture<'_, Option<SocketEvent>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some(SocketEvent::Message(text.to_string()))
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => return Some(SocketEvent::Message(text)),
                            Err(_) => {
                                log::warn!("Ignoring non UTF-8 binary LiveQuery frame");
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => return Some(SocketEvent::Pong),
                    Some(Ok(Message::Close(frame))) => {
                        return Some(SocketEvent::Closed {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame.map(|f| f.reason.to_string()),
                        })
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some(SocketEvent::Error(e.to_string())),
                    None => return None,
                }
            }
        })
    }
}
