// src/live_query/context.rs

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::ParseError;
use crate::live_query::client::{ParseLiveQuery, WeakParseLiveQuery};
use crate::live_query::config::{CredentialsProvider, LiveQueryConfig};
use crate::live_query::transport::{SocketConnector, SocketPool, TungsteniteConnector};

/// Owns the socket pool shared by a set of LiveQuery clients, plus an optional default
/// client.
///
/// Only the default client is kept alive by the context. Other clients it built are
/// remembered weakly so [`shutdown`](Self::shutdown) can close those still in use.
///
/// Applications that talk to a single LiveQuery server call [`init`](Self::init) once
/// and fetch the client with [`default_client`](Self::default_client) wherever it is
/// needed; additional clients can be built with [`client`](Self::client).
pub struct LiveQueryContext {
    connector: Arc<dyn SocketConnector>,
    sockets: SocketPool,
    default: RwLock<Option<ParseLiveQuery>>,
    clients: Mutex<Vec<WeakParseLiveQuery>>,
}

impl Default for LiveQueryContext {
    fn default() -> Self {
        Self::with_connector(Arc::new(TungsteniteConnector::new()))
    }
}

impl LiveQueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose clients connect through `connector`.
    pub fn with_connector(connector: Arc<dyn SocketConnector>) -> Self {
        LiveQueryContext {
            connector,
            sockets: SocketPool::new(),
            default: RwLock::new(None),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn sockets(&self) -> &SocketPool {
        &self.sockets
    }

    /// Builds a client and makes it the default one.
    pub fn init(
        &self,
        config: LiveQueryConfig,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> ParseLiveQuery {
        let client = self.client(config, credentials);
        self.set_default(client.clone());
        client
    }

    /// Builds a client sharing this context's socket pool.
    pub fn client(
        &self,
        config: LiveQueryConfig,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> ParseLiveQuery {
        let client = ParseLiveQuery::with_transport(
            config,
            credentials,
            self.connector.clone(),
            self.sockets.clone(),
        );
        self.track(&client);
        client
    }

    /// Replaces the default client.
    pub fn set_default(&self, client: ParseLiveQuery) {
        self.track(&client);
        *self
            .default
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    /// Fails with [`ParseError::NotConfigured`] until [`init`](Self::init) or
    /// [`set_default`](Self::set_default) was called.
    pub fn default_client(&self) -> Result<ParseLiveQuery, ParseError> {
        self.default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ParseError::NotConfigured)
    }

    /// Closes every client of this context that is still alive and forgets them.
    pub async fn shutdown(&self) {
        let clients: Vec<ParseLiveQuery> = std::mem::take(&mut *self.clients())
            .iter()
            .filter_map(WeakParseLiveQuery::upgrade)
            .collect();
        self.default
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log::info!("Shutting down {} LiveQuery client(s)", clients.len());
        for client in clients {
            client.shutdown().await;
        }
    }

    fn clients(&self) -> MutexGuard<'_, Vec<WeakParseLiveQuery>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, client: &ParseLiveQuery) {
        let mut clients = self.clients();
        clients.retain(WeakParseLiveQuery::is_alive);
        if !clients.iter().any(|known| known.refers_to(client)) {
            clients.push(client.downgrade());
        }
    }
}
