// src/live_query/client.rs

//! The LiveQuery protocol state machine.
//!
//! One [`ParseLiveQuery`] owns at most one socket and multiplexes any number of
//! subscriptions over it. Application calls and socket callbacks may come from
//! different tasks; all mutable state sits behind a single mutex per client, and
//! subscriber callbacks always run after that mutex is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use url::Url;

use crate::error::ParseError;
use crate::live_query::config::{websocket_url, CredentialsProvider, LiveQueryConfig};
use crate::live_query::messages::{
    self, ClientOperation, ConnectionResponse, ErrorResponse, EventKind, EventResponse,
    RedirectResponse, ServerResponse, StandardMessage, SubscribeMessage, SubscriptionResponse,
};
use crate::live_query::registry::{PendingKind, SubscriptionRegistry};
use crate::live_query::subscription::{Subscription, SubscriptionHandler};
use crate::live_query::transport::{
    SocketConnector, SocketDelegate, SocketEvent, SocketHandle, SocketId, SocketPool,
    TungsteniteConnector,
};
use crate::query::ParseQuery;
use crate::types::RequestId;

/// Connection lifecycle of a [`ParseLiveQuery`] client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No socket, and none being opened.
    SocketNotEstablished,
    /// A socket is being opened, or is open and waiting for the server's `connected`.
    Connecting,
    Connected,
    /// The socket dropped unexpectedly; a reconnect is scheduled.
    Disconnected,
    Closing,
    Closed,
}

/// Client-level notifications. Every method has an empty default.
pub trait LiveQueryDelegate: Send + Sync {
    /// Server `error` messages, reconciliation failures and reconnect exhaustion.
    fn received_error(&self, _error: &ParseError) {}

    /// A frame that could not be decoded; it has been dropped.
    fn received_unsupported(&self, _data: &str, _error: &ParseError) {}

    fn received_pong(&self) {}

    fn closed_socket(&self, _code: Option<u16>, _reason: Option<String>) {}
}

/// Work produced while the state lock is held and carried out after it is released.
enum Dispatch {
    Subscribed(Arc<dyn SubscriptionHandler>, ParseQuery, bool),
    Unsubscribed(Arc<dyn SubscriptionHandler>),
    Event(Arc<dyn SubscriptionHandler>, EventKind, EventResponse),
    SubscriptionError(Arc<dyn SubscriptionHandler>, ParseError),
    ClientError(ParseError),
    Unsupported(String, ParseError),
    Pong,
    SocketClosed(Option<u16>, Option<String>),
    CloseSocket(SocketHandle),
    Reconnect(Option<Duration>),
}

struct ClientState {
    status: ConnectionStatus,
    url: Url,
    client_id: Option<String>,
    installation_id: Option<String>,
    attempts: u32,
    is_disconnected_by_user: bool,
    registry: SubscriptionRegistry<Arc<dyn SubscriptionHandler>>,
    socket: Option<SocketHandle>,
    last_error: Option<ParseError>,
}

impl ClientState {
    fn new(url: Url) -> Self {
        ClientState {
            status: ConnectionStatus::SocketNotEstablished,
            url,
            client_id: None,
            installation_id: None,
            attempts: 0,
            is_disconnected_by_user: false,
            registry: SubscriptionRegistry::new(),
            socket: None,
            last_error: None,
        }
    }

    fn is_active_socket(&self, socket: SocketId) -> bool {
        self.socket.as_ref().map(SocketHandle::id) == Some(socket)
    }
}

enum OpenPlan {
    AlreadyOpen,
    WaitForPending,
    Connect(Url),
}

struct ClientInner {
    me: Weak<ClientInner>,
    config: LiveQueryConfig,
    credentials: Arc<dyn CredentialsProvider>,
    connector: Arc<dyn SocketConnector>,
    sockets: SocketPool,
    state: Mutex<ClientState>,
    status_tx: watch::Sender<ConnectionStatus>,
    delegate: RwLock<Option<Arc<dyn LiveQueryDelegate>>>,
}

/// A LiveQuery client: one WebSocket connection to a Parse LiveQuery server and every
/// subscription multiplexed over it.
///
/// `ParseLiveQuery` is cheaply cloneable; clones share the connection and the
/// subscriptions. Subscribing does not wait for the server: the returned
/// [`Subscription`] reports the confirmation later. Subscriptions made while
/// disconnected are sent once the server accepts the connection, and confirmed
/// subscriptions are sent again after every reconnect.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use parse_live_query::{LiveQueryConfig, ParseLiveQuery, ParseObject, ParseQuery, StaticCredentials};
/// # use parse_live_query::ParseError;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), ParseError> {
/// let config = LiveQueryConfig::new("ws://localhost:1337", "myAppId")?.with_client_key("myClientKey");
/// let client = ParseLiveQuery::new(config, Arc::new(StaticCredentials::default()));
/// client.open(true).await?;
///
/// let mut query = ParseQuery::new("GameScore");
/// query.greater_than("points", 9);
/// let subscription = client.subscribe::<ParseObject>(query)?;
/// subscription.handle_event(|_, event| println!("{:?}", event));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ParseLiveQuery {
    inner: Arc<ClientInner>,
}

impl ParseLiveQuery {
    /// Creates a client that connects with `tokio-tungstenite` and owns its own socket pool.
    pub fn new(config: LiveQueryConfig, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self::with_transport(
            config,
            credentials,
            Arc::new(TungsteniteConnector::new()),
            SocketPool::new(),
        )
    }

    /// Creates a client on a custom transport and a possibly shared socket pool.
    pub fn with_transport(
        config: LiveQueryConfig,
        credentials: Arc<dyn CredentialsProvider>,
        connector: Arc<dyn SocketConnector>,
        sockets: SocketPool,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::SocketNotEstablished);
        let url = config.server_url.clone();
        let inner = Arc::new_cyclic(|me| ClientInner {
            me: me.clone(),
            config,
            credentials,
            connector,
            sockets,
            state: Mutex::new(ClientState::new(url)),
            status_tx,
            delegate: RwLock::new(None),
        });
        ParseLiveQuery { inner }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn LiveQueryDelegate>) {
        *self
            .inner
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(delegate);
    }

    pub fn config(&self) -> &LiveQueryConfig {
        &self.inner.config
    }

    /// Opens the socket and waits until the server accepts the connection.
    ///
    /// `is_user_wants_to_connect` distinguishes an explicit request, which clears a
    /// previous [`close`](Self::close) and the attempt counter, from an automatic
    /// reconnect, which is skipped after a user close. Returns immediately when already
    /// connected.
    pub async fn open(&self, is_user_wants_to_connect: bool) -> Result<(), ParseError> {
        self.inner.open(is_user_wants_to_connect).await
    }

    /// Closes the socket without a close code. See [`close_with`](Self::close_with).
    pub async fn close(&self) {
        self.inner.close_with(None, None).await
    }

    /// Closes the socket and stops reconnecting.
    ///
    /// Subscriptions stay registered: a later [`open`](Self::open) sends them again.
    pub async fn close_with(&self, code: Option<u16>, reason: Option<String>) {
        self.inner.close_with(code, reason).await
    }

    /// Closes the socket and forgets every subscription.
    pub async fn shutdown(&self) {
        self.inner.close_with(None, None).await;
        self.inner.state().registry.clear();
    }

    /// Registers a subscription for `query` and returns its handle right away.
    ///
    /// The subscribe message is sent immediately when connected, otherwise as soon as
    /// the connection is established.
    pub fn subscribe<T>(&self, query: ParseQuery) -> Result<Subscription<T>, ParseError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        validate_query(&query)?;
        let mut state = self.inner.state();
        let request_id = state.registry.next_request_id()?;
        let subscription = Subscription::new(request_id, query.clone());
        state.registry.add_pending(
            request_id,
            query.clone(),
            subscription.handler(),
            PendingKind::Subscribe,
        );

        if state.status == ConnectionStatus::Connected {
            self.inner
                .send_request(&state, request_id, &query, PendingKind::Subscribe);
        } else {
            log::debug!(
                "LiveQuery subscription {} on '{}' queued until connected",
                request_id,
                query.class_name()
            );
        }
        Ok(subscription)
    }

    /// Asks the server to drop the confirmed subscription for `query`.
    ///
    /// The subscription stays active until the server confirms; fails if no confirmed
    /// subscription matches or its unsubscription is already in flight.
    pub fn unsubscribe(&self, query: &ParseQuery) -> Result<(), ParseError> {
        let mut state = self.inner.state();
        let matching: Vec<RequestId> = state
            .registry
            .snapshot_current()
            .into_iter()
            .filter(|(_, current)| current == query)
            .map(|(id, _)| id)
            .collect();
        if matching.is_empty() {
            return Err(ParseError::QueryNotSubscribed(format!(
                "no confirmed subscription for class '{}'",
                query.class_name()
            )));
        }
        let request_id = matching
            .iter()
            .copied()
            .find(|id| state.registry.pending_kind(*id) != Some(PendingKind::Unsubscribe))
            .unwrap_or(matching[0]);
        self.inner.unsubscribe_request(&mut state, request_id)
    }

    /// Like [`unsubscribe`](Self::unsubscribe), addressed by subscription handle.
    pub fn unsubscribe_subscription<T>(&self, subscription: &Subscription<T>) -> Result<(), ParseError> {
        let mut state = self.inner.state();
        let request_id = subscription.request_id();
        if !state.registry.is_current(request_id) {
            return Err(ParseError::QueryNotSubscribed(format!(
                "requestId {} has no confirmed subscription",
                request_id
            )));
        }
        self.inner.unsubscribe_request(&mut state, request_id)
    }

    /// Replaces the query of an existing subscription, keeping its request id.
    ///
    /// A confirmed subscription keeps receiving events for its old query until the
    /// server confirms the new one; the confirmation reports `is_new == false`.
    /// [`Subscription::query`] switches to the new query only on that confirmation, so
    /// a rejected update leaves the handle on the query the server still serves.
    pub fn update<T>(&self, subscription: &Subscription<T>, query: ParseQuery) -> Result<(), ParseError> {
        validate_query(&query)?;
        let mut state = self.inner.state();
        let request_id = subscription.request_id();
        let handler = state.registry.handler_for(request_id).ok_or_else(|| {
            ParseError::QueryNotSubscribed(format!("requestId {} is not registered", request_id))
        })?;
        if state.registry.pending_kind(request_id) == Some(PendingKind::Unsubscribe) {
            return Err(ParseError::InvalidInput(format!(
                "requestId {} is being unsubscribed",
                request_id
            )));
        }

        let kind = if state.registry.is_current(request_id) {
            PendingKind::Update
        } else {
            PendingKind::Subscribe
        };
        state
            .registry
            .add_pending(request_id, query.clone(), handler, kind);

        if state.status == ConnectionStatus::Connected {
            self.inner.send_request(&state, request_id, &query, kind);
        }
        Ok(())
    }

    /// Drops not-yet-confirmed subscriptions for `query` without contacting the server.
    /// Returns whether anything was removed.
    pub fn remove_pending_subscription(&self, query: &ParseQuery) -> bool {
        let removed = self.inner.state().registry.remove_pending_query(query);
        !removed.is_empty()
    }

    /// Processes one text frame as if it arrived on the active socket. Frames are
    /// dropped while no socket is open.
    pub fn received(&self, data: &str) {
        self.inner.received_from(None, data)
    }

    /// Sends a WebSocket ping. Fails right away with [`ParseError::NotConnected`] when
    /// the client is not connected.
    pub async fn send_ping(&self) -> Result<(), ParseError> {
        let socket = {
            let state = self.inner.state();
            if state.status != ConnectionStatus::Connected {
                return Err(ParseError::NotConnected);
            }
            state.socket.clone()
        };
        match socket {
            Some(socket) => socket.ping().await,
            None => Err(ParseError::NotConnected),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state().status
    }

    /// Id assigned by the server in its `connected` message.
    pub fn client_id(&self) -> Option<String> {
        self.inner.state().client_id.clone()
    }

    /// Installation id echoed by the server in its `connected` message.
    pub fn installation_id(&self) -> Option<String> {
        self.inner.state().installation_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status() == ConnectionStatus::Connecting
    }

    pub fn is_disconnected_by_user(&self) -> bool {
        self.inner.state().is_disconnected_by_user
    }

    /// Failed connection attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.inner.state().attempts
    }

    /// The server URL used for the next connection; changed by `redirect` messages.
    pub fn url(&self) -> Url {
        self.inner.state().url.clone()
    }

    /// Whether a server-confirmed subscription exists for `query`.
    pub fn is_subscribed(&self, query: &ParseQuery) -> bool {
        self.inner.state().registry.is_current_query(query)
    }

    /// Whether a request for `query` is waiting for the server.
    pub fn is_pending_subscription(&self, query: &ParseQuery) -> bool {
        self.inner.state().registry.is_pending_query(query)
    }

    pub fn pending_subscriptions(&self) -> BTreeMap<RequestId, ParseQuery> {
        self.inner.state().registry.snapshot_pending()
    }

    pub fn current_subscriptions(&self) -> BTreeMap<RequestId, ParseQuery> {
        self.inner.state().registry.snapshot_current()
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &ParseLiveQuery) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakParseLiveQuery {
        WeakParseLiveQuery {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A reference to a [`ParseLiveQuery`] that does not keep it alive.
#[derive(Clone)]
pub(crate) struct WeakParseLiveQuery {
    inner: Weak<ClientInner>,
}

impl WeakParseLiveQuery {
    pub(crate) fn upgrade(&self) -> Option<ParseLiveQuery> {
        self.inner.upgrade().map(|inner| ParseLiveQuery { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub(crate) fn refers_to(&self, client: &ParseLiveQuery) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&client.inner))
    }
}

fn validate_query(query: &ParseQuery) -> Result<(), ParseError> {
    if query.class_name().is_empty() {
        return Err(ParseError::InvalidClassName(
            "a live query needs a class name".to_string(),
        ));
    }
    Ok(())
}

/// Resets a connection attempt that was abandoned, e.g. because the caller dropped
/// the `open` future, so the next `open` does not wait on it forever.
struct ConnectAttempt<'a> {
    inner: &'a ClientInner,
    settled: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.state();
        if state.status == ConnectionStatus::Connecting && state.socket.is_none() {
            self.inner
                .set_status(&mut state, ConnectionStatus::SocketNotEstablished);
        }
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut ClientState, status: ConnectionStatus) {
        if state.status != status {
            log::debug!("LiveQuery status {:?} -> {:?}", state.status, status);
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    async fn open(&self, is_user_wants_to_connect: bool) -> Result<(), ParseError> {
        let plan = {
            let mut state = self.state();
            if is_user_wants_to_connect {
                state.is_disconnected_by_user = false;
                state.attempts = 0;
            }
            let status = state.status;
            match status {
                ConnectionStatus::Connected => OpenPlan::AlreadyOpen,
                ConnectionStatus::Connecting => OpenPlan::WaitForPending,
                _ if state.is_disconnected_by_user => {
                    log::debug!("Not reopening a LiveQuery socket closed by the user");
                    OpenPlan::AlreadyOpen
                }
                _ if state.attempts > self.config.max_connection_attempts => {
                    self.set_status(&mut state, ConnectionStatus::SocketNotEstablished);
                    return Err(ParseError::MaxConnectionAttempts(
                        self.config.max_connection_attempts,
                    ));
                }
                _ => {
                    self.set_status(&mut state, ConnectionStatus::Connecting);
                    OpenPlan::Connect(state.url.clone())
                }
            }
        };

        let url = match plan {
            OpenPlan::AlreadyOpen => return Ok(()),
            OpenPlan::WaitForPending => return self.wait_for_connection(false).await,
            OpenPlan::Connect(url) => url,
        };

        let mut attempt = ConnectAttempt {
            inner: self,
            settled: false,
        };
        log::info!("Opening LiveQuery socket to {}", url);
        let connected =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&url)).await;
        attempt.settled = true;

        let parts = match connected {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return Err(self.connection_failed(e, is_user_wants_to_connect)),
            Err(_) => {
                let error = ParseError::Timeout(format!("connecting to {}", url));
                return Err(self.connection_failed(error, is_user_wants_to_connect));
            }
        };

        let dispatches = {
            let mut state = self.state();
            if state.status != ConnectionStatus::Connecting {
                log::debug!("Discarding LiveQuery socket to {}: client moved on", url);
                return Err(ParseError::ConnectionFailed(
                    "connection attempt was cancelled".to_string(),
                ));
            }

            let delegate: Weak<dyn SocketDelegate> = self.me.clone();
            let socket = self.sockets.attach(parts, delegate);
            let mut dispatches = Vec::new();
            if let Some(previous) = state.socket.replace(socket) {
                self.sockets.set_receiving(previous.id(), false);
                dispatches.push(Dispatch::CloseSocket(previous));
            }

            let connect = self.connect_message();
            if let Err(e) = self.send(&state, &connect) {
                dispatches.extend(self.fail_connection(
                    &mut state,
                    e.clone(),
                    is_user_wants_to_connect,
                ));
                drop(state);
                self.deliver(dispatches);
                return Err(e);
            }
            dispatches
        };
        self.deliver(dispatches);

        self.wait_for_connection(is_user_wants_to_connect).await
    }

    async fn wait_for_connection(&self, is_user_wants_to_connect: bool) -> Result<(), ParseError> {
        let mut status = self.status_tx.subscribe();
        let settled = tokio::time::timeout(
            self.config.connect_timeout,
            status.wait_for(|status| *status != ConnectionStatus::Connecting),
        )
        .await;

        let status = match settled {
            Ok(Ok(status)) => *status,
            Ok(Err(_)) => return Err(ParseError::NotConnected),
            Err(_) => {
                let error = ParseError::Timeout(
                    "waiting for the LiveQuery server to accept the connection".to_string(),
                );
                let dispatches = {
                    let mut state = self.state();
                    if state.status == ConnectionStatus::Connecting {
                        self.fail_connection(&mut state, error.clone(), is_user_wants_to_connect)
                    } else {
                        Vec::new()
                    }
                };
                self.deliver(dispatches);
                return Err(error);
            }
        };

        if status == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(self
                .state()
                .last_error
                .clone()
                .unwrap_or(ParseError::NotConnected))
        }
    }

    fn connection_failed(&self, error: ParseError, is_user_wants_to_connect: bool) -> ParseError {
        log::warn!("LiveQuery connection failed: {}", error);
        let dispatches = {
            let mut state = self.state();
            self.fail_connection(&mut state, error.clone(), is_user_wants_to_connect)
        };
        self.deliver(dispatches);
        error
    }

    /// Tears down the socket after a failed connection. Automatic attempts are retried
    /// under the reconnect policy; a failed explicit `open` is reported to its caller.
    fn fail_connection(
        &self,
        state: &mut ClientState,
        error: ParseError,
        is_user_wants_to_connect: bool,
    ) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        state.last_error = Some(error);
        state.client_id = None;
        if let Some(socket) = state.socket.take() {
            self.sockets.set_receiving(socket.id(), false);
            dispatches.push(Dispatch::CloseSocket(socket));
        }
        if is_user_wants_to_connect || state.is_disconnected_by_user {
            self.set_status(state, ConnectionStatus::SocketNotEstablished);
        } else {
            dispatches.extend(self.schedule_reconnect(state));
        }
        dispatches
    }

    fn schedule_reconnect(&self, state: &mut ClientState) -> Vec<Dispatch> {
        let max = self.config.max_connection_attempts;
        state.attempts += 1;
        if state.attempts <= max {
            log::info!("LiveQuery reconnect attempt {} of {}", state.attempts, max);
            self.set_status(state, ConnectionStatus::Disconnected);
            let delay = self
                .config
                .reconnect_backoff
                .map(|backoff| backoff.delay(state.attempts));
            vec![Dispatch::Reconnect(delay)]
        } else {
            log::warn!("LiveQuery gave up reconnecting after {} attempts", max);
            let error = ParseError::MaxConnectionAttempts(max);
            state.last_error = Some(error.clone());
            self.set_status(state, ConnectionStatus::SocketNotEstablished);
            vec![Dispatch::ClientError(error)]
        }
    }

    async fn close_with(&self, code: Option<u16>, reason: Option<String>) {
        let socket = {
            let mut state = self.state();
            state.is_disconnected_by_user = true;
            self.set_status(&mut state, ConnectionStatus::Closing);
            state.client_id = None;
            state.installation_id = None;
            state.socket.take()
        };

        if let Some(socket) = socket {
            log::info!("Closing LiveQuery socket {:?}", socket.id());
            self.sockets
                .close(socket, code, reason, self.config.close_grace_period)
                .await;
        }

        let mut state = self.state();
        self.set_status(&mut state, ConnectionStatus::Closed);
        self.set_status(&mut state, ConnectionStatus::SocketNotEstablished);
    }

    fn connect_message(&self) -> StandardMessage {
        let additional = self.config.connection_additional_properties;
        StandardMessage {
            op: ClientOperation::Connect,
            application_id: Some(self.config.application_id.clone()),
            client_key: self.config.client_key.clone(),
            master_key: self.config.master_key.clone(),
            maintenance_key: self.config.maintenance_key.clone(),
            session_token: additional
                .then(|| self.credentials.session_token())
                .flatten(),
            installation_id: additional
                .then(|| self.credentials.installation_id())
                .flatten(),
            request_id: None,
        }
    }

    fn subscribe_message(
        &self,
        op: ClientOperation,
        request_id: RequestId,
        query: &ParseQuery,
    ) -> SubscribeMessage {
        SubscribeMessage {
            op,
            request_id,
            query: query.to_subscribe_query(),
            session_token: self
                .config
                .connection_additional_properties
                .then(|| self.credentials.session_token())
                .flatten(),
        }
    }

    fn send<M: Serialize>(&self, state: &ClientState, message: &M) -> Result<(), ParseError> {
        let socket = state.socket.as_ref().ok_or(ParseError::NotConnected)?;
        let text = messages::encode(message)?;
        log::debug!("LiveQuery send: {}", text);
        socket.send_text(text)
    }

    /// Sends a request; on failure it stays pending and is resent after reconnecting.
    fn send_request(
        &self,
        state: &ClientState,
        request_id: RequestId,
        query: &ParseQuery,
        kind: PendingKind,
    ) {
        let result = match kind {
            PendingKind::Subscribe => self.send(
                state,
                &self.subscribe_message(ClientOperation::Subscribe, request_id, query),
            ),
            PendingKind::Update => self.send(
                state,
                &self.subscribe_message(ClientOperation::Update, request_id, query),
            ),
            PendingKind::Unsubscribe => self.send(state, &StandardMessage::unsubscribe(request_id)),
        };
        if let Err(e) = result {
            log::warn!("Could not send LiveQuery request {}: {}", request_id, e);
        }
    }

    fn unsubscribe_request(
        &self,
        state: &mut ClientState,
        request_id: RequestId,
    ) -> Result<(), ParseError> {
        if state.registry.pending_kind(request_id) == Some(PendingKind::Unsubscribe) {
            return Err(ParseError::InvalidInput(format!(
                "unsubscribe for requestId {} is already pending",
                request_id
            )));
        }
        let (query, handler) = match (
            state.registry.query_for(request_id).cloned(),
            state.registry.handler_for(request_id),
        ) {
            (Some(query), Some(handler)) => (query, handler),
            _ => {
                return Err(ParseError::QueryNotSubscribed(format!(
                    "requestId {} is not registered",
                    request_id
                )))
            }
        };

        state
            .registry
            .add_pending(request_id, query.clone(), handler, PendingKind::Unsubscribe);
        if state.status == ConnectionStatus::Connected {
            self.send_request(state, request_id, &query, PendingKind::Unsubscribe);
        }
        Ok(())
    }

    /// Decodes and applies one inbound frame. `socket` is the socket the frame came
    /// from, `None` for frames handed to [`ParseLiveQuery::received`]; frames from any
    /// socket but the active one are dropped.
    fn received_from(&self, socket: Option<SocketId>, data: &str) {
        log::debug!("LiveQuery received: {}", data);
        let response = match ServerResponse::decode(data) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Dropping LiveQuery message: {}", e);
                self.deliver(vec![Dispatch::Unsupported(data.to_string(), e)]);
                return;
            }
        };

        let dispatches = {
            let mut state = self.state();
            match socket {
                Some(socket) if !state.is_active_socket(socket) => {
                    log::warn!("Ignoring message from replaced socket {:?}", socket);
                    return;
                }
                None if state.socket.is_none() => {
                    log::warn!("Ignoring LiveQuery message: no socket is open");
                    return;
                }
                _ => {}
            }
            self.apply(&mut state, response)
        };
        self.deliver(dispatches);
    }

    fn apply(&self, state: &mut ClientState, response: ServerResponse) -> Vec<Dispatch> {
        match response {
            ServerResponse::Connected(connected) => self.apply_connected(state, connected),
            ServerResponse::Subscribed(subscribed) => self.apply_subscribed(state, subscribed),
            ServerResponse::Unsubscribed(unsubscribed) => {
                self.apply_unsubscribed(state, unsubscribed)
            }
            ServerResponse::Error(error) => self.apply_error(state, error),
            ServerResponse::Create(event) => self.apply_event(state, EventKind::Create, event),
            ServerResponse::Update(event) => self.apply_event(state, EventKind::Update, event),
            ServerResponse::Enter(event) => self.apply_event(state, EventKind::Enter, event),
            ServerResponse::Leave(event) => self.apply_event(state, EventKind::Leave, event),
            ServerResponse::Delete(event) => self.apply_event(state, EventKind::Delete, event),
            ServerResponse::Redirect(redirect) => self.apply_redirect(state, redirect),
        }
    }

    fn apply_connected(
        &self,
        state: &mut ClientState,
        connected: ConnectionResponse,
    ) -> Vec<Dispatch> {
        log::info!("LiveQuery connected as client {}", connected.client_id);
        state.client_id = Some(connected.client_id);
        state.installation_id = connected.installation_id;
        state.attempts = 0;
        state.last_error = None;
        self.set_status(state, ConnectionStatus::Connected);

        let dispatches: Vec<Dispatch> = state
            .registry
            .requeue_for_resubscribe()
            .into_iter()
            .map(|(_, entry)| Dispatch::Unsubscribed(entry.handler))
            .collect();
        for (request_id, query, kind) in state.registry.pending_requests() {
            self.send_request(state, request_id, &query, kind);
        }
        dispatches
    }

    /// Reports a response that does not match local state, without changing it.
    fn reconciliation_error(
        &self,
        state: &ClientState,
        request_id: RequestId,
        error: ParseError,
    ) -> Vec<Dispatch> {
        log::warn!("LiveQuery reconciliation failed: {}", error);
        let mut dispatches = vec![Dispatch::ClientError(error.clone())];
        if let Some(handler) = state.registry.handler_for(request_id) {
            dispatches.push(Dispatch::SubscriptionError(handler, error));
        }
        dispatches
    }

    fn check_client_id(
        &self,
        state: &ClientState,
        response: &SubscriptionResponse,
    ) -> Result<(), Vec<Dispatch>> {
        if state.client_id.as_deref() == Some(response.client_id.as_str()) {
            return Ok(());
        }
        let error = ParseError::ClientIdMismatch {
            expected: state.client_id.clone(),
            received: response.client_id.clone(),
        };
        Err(self.reconciliation_error(state, response.request_id, error))
    }

    fn apply_subscribed(
        &self,
        state: &mut ClientState,
        subscribed: SubscriptionResponse,
    ) -> Vec<Dispatch> {
        if let Err(dispatches) = self.check_client_id(state, &subscribed) {
            return dispatches;
        }
        let request_id = subscribed.request_id;
        match state.registry.pending_kind(request_id) {
            None => {
                return self.reconciliation_error(
                    state,
                    request_id,
                    ParseError::UnknownRequestId(request_id),
                )
            }
            Some(PendingKind::Unsubscribe) => {
                log::debug!(
                    "Ignoring subscribed for requestId {}: unsubscribe pending",
                    request_id
                );
                return Vec::new();
            }
            Some(_) => {}
        }

        match state.registry.promote(request_id) {
            Some(promotion) => vec![Dispatch::Subscribed(
                promotion.handler,
                promotion.query,
                promotion.is_new,
            )],
            None => Vec::new(),
        }
    }

    fn apply_unsubscribed(
        &self,
        state: &mut ClientState,
        unsubscribed: SubscriptionResponse,
    ) -> Vec<Dispatch> {
        if let Err(dispatches) = self.check_client_id(state, &unsubscribed) {
            return dispatches;
        }
        let request_id = unsubscribed.request_id;
        match state.registry.remove_pending(request_id) {
            Some(entry) => {
                state.registry.remove_current(request_id);
                vec![Dispatch::Unsubscribed(entry.handler)]
            }
            None => self.reconciliation_error(
                state,
                request_id,
                ParseError::UnknownRequestId(request_id),
            ),
        }
    }

    fn apply_event(
        &self,
        state: &mut ClientState,
        kind: EventKind,
        event: EventResponse,
    ) -> Vec<Dispatch> {
        match state.registry.handler_for(event.request_id) {
            Some(handler) => vec![Dispatch::Event(handler, kind, event)],
            None => {
                log::debug!(
                    "Dropping {:?} event for unknown requestId {}",
                    kind,
                    event.request_id
                );
                Vec::new()
            }
        }
    }

    fn apply_error(&self, state: &mut ClientState, response: ErrorResponse) -> Vec<Dispatch> {
        let error = ParseError::from_live_query_error(&response);
        log::warn!("LiveQuery server error: {}", error);
        let mut dispatches = vec![Dispatch::ClientError(error.clone())];

        // Errors tagged with a request id concern that subscription only.
        if let Some(request_id) = response.request_id {
            if let Some(handler) = state.registry.handler_for(request_id) {
                dispatches.push(Dispatch::SubscriptionError(handler, error));
            }
            state.registry.remove_pending(request_id);
            return dispatches;
        }

        state.last_error = Some(error);
        state.client_id = None;
        if let Some(socket) = state.socket.take() {
            self.sockets.set_receiving(socket.id(), false);
            dispatches.push(Dispatch::CloseSocket(socket));
        }
        if response.reconnect && !state.is_disconnected_by_user {
            dispatches.extend(self.schedule_reconnect(state));
        } else {
            state.is_disconnected_by_user = true;
            self.set_status(state, ConnectionStatus::SocketNotEstablished);
        }
        dispatches
    }

    fn apply_redirect(&self, state: &mut ClientState, redirect: RedirectResponse) -> Vec<Dispatch> {
        match websocket_url(&redirect.url) {
            Ok(url) => {
                log::info!("LiveQuery redirected to {}", url);
                state.url = url;
                Vec::new()
            }
            Err(e) => {
                log::warn!("Ignoring LiveQuery redirect to '{}': {}", redirect.url, e);
                vec![Dispatch::ClientError(e)]
            }
        }
    }

    fn socket_lost(
        &self,
        socket: SocketId,
        code: Option<u16>,
        reason: Option<String>,
        error: Option<ParseError>,
    ) {
        let dispatches = {
            let mut state = self.state();
            if !state.is_active_socket(socket) {
                return;
            }
            log::info!("LiveQuery socket {:?} closed ({:?}, {:?})", socket, code, reason);
            state.socket = None;
            self.sockets.detach(socket);
            state.client_id = None;

            let mut dispatches = vec![Dispatch::SocketClosed(code, reason)];
            if let Some(error) = error {
                state.last_error = Some(error.clone());
                dispatches.push(Dispatch::ClientError(error));
            }
            let closing = matches!(
                state.status,
                ConnectionStatus::Closing | ConnectionStatus::Closed
            );
            if state.is_disconnected_by_user || closing {
                self.set_status(&mut state, ConnectionStatus::SocketNotEstablished);
            } else {
                dispatches.extend(self.schedule_reconnect(&mut state));
            }
            dispatches
        };
        self.deliver(dispatches);
    }

    fn deliver(&self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        let delegate = self
            .delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for dispatch in dispatches {
            match dispatch {
                Dispatch::Subscribed(handler, query, is_new) => {
                    handler.replace_query(query);
                    handler.did_subscribe(is_new);
                }
                Dispatch::Unsubscribed(handler) => handler.did_unsubscribe(),
                Dispatch::Event(handler, kind, event) => handler.did_receive(kind, event),
                Dispatch::SubscriptionError(handler, error) => handler.did_fail(error),
                Dispatch::ClientError(error) => {
                    if let Some(delegate) = &delegate {
                        delegate.received_error(&error);
                    }
                }
                Dispatch::Unsupported(data, error) => {
                    if let Some(delegate) = &delegate {
                        delegate.received_unsupported(&data, &error);
                    }
                }
                Dispatch::Pong => {
                    if let Some(delegate) = &delegate {
                        delegate.received_pong();
                    }
                }
                Dispatch::SocketClosed(code, reason) => {
                    if let Some(delegate) = &delegate {
                        delegate.closed_socket(code, reason);
                    }
                }
                Dispatch::CloseSocket(socket) => {
                    let id = socket.id();
                    let sockets = self.sockets.clone();
                    let grace = self.config.close_grace_period;
                    let closing = async move { sockets.close(socket, None, None, grace).await };
                    if !spawn_detached(closing) {
                        self.sockets.detach(id);
                    }
                }
                Dispatch::Reconnect(delay) => self.spawn_reconnect(delay),
            }
        }
    }

    fn spawn_reconnect(&self, delay: Option<Duration>) {
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let _ = spawn_detached(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = inner.open(false).await {
                log::warn!("LiveQuery reconnect attempt failed: {}", e);
            }
        });
    }
}

/// Returns `false` when no tokio runtime is available and the task was skipped.
fn spawn_detached<F>(future: F) -> bool
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(future);
            true
        }
        Err(_) => {
            log::warn!("No tokio runtime available; LiveQuery background task skipped");
            false
        }
    }
}

impl SocketDelegate for ClientInner {
    fn socket_event(&self, socket: SocketId, event: SocketEvent) {
        match event {
            SocketEvent::Message(text) => self.received_from(Some(socket), &text),
            SocketEvent::Pong => {
                if self.state().is_active_socket(socket) {
                    self.deliver(vec![Dispatch::Pong]);
                }
            }
            SocketEvent::Closed { code, reason } => self.socket_lost(socket, code, reason, None),
            SocketEvent::Error(message) => {
                let error = ParseError::TransportError(message);
                self.socket_lost(socket, None, None, Some(error))
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = state.socket.take() {
            self.sockets.detach(socket.id());
        }
    }
}
