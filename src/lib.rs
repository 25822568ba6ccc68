pub mod client;
pub mod error;
pub mod live_query;
pub mod object;
pub mod query;
pub mod types;

pub use client::Parse;
pub use error::ParseError;
pub use object::ParseObject;
pub use query::ParseQuery;

pub use live_query::{
    ConnectionStatus, CredentialsProvider, Event, LiveQueryConfig, LiveQueryContext,
    LiveQueryDelegate, ParseLiveQuery, ReconnectBackoff, StaticCredentials, Subscription,
    SubscriptionState, SubscriptionUpdate,
};

// Re-export key types from the types module if needed directly
pub use types::{ParseDate, RequestId};
