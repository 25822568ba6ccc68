// src/live_query/mod.rs

//! Client for the Parse LiveQuery protocol: real-time object events over a WebSocket.

pub mod client;
pub mod config;
pub mod context;
pub mod messages;
pub mod registry;
pub mod subscription;
pub mod transport;

pub use client::{ConnectionStatus, LiveQueryDelegate, ParseLiveQuery};
pub use config::{
    websocket_url, CredentialsProvider, LiveQueryConfig, ReconnectBackoff, StaticCredentials,
    DEFAULT_MAX_CONNECTION_ATTEMPTS,
};
pub use context::LiveQueryContext;
pub use messages::EventKind;
pub use registry::{PendingKind, SubscriptionRegistry};
pub use subscription::{Event, Subscription, SubscriptionState, SubscriptionUpdate};
pub use transport::{
    SocketConnector, SocketEvent, SocketId, SocketParts, SocketPool, SocketReader, SocketWriter,
    TungsteniteConnector,
};
