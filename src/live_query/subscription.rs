// src/live_query/subscription.rs

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ParseError;
use crate::live_query::messages::{EventKind, EventResponse};
use crate::query::ParseQuery;
use crate::types::RequestId;

/// An object event pushed by the server for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    /// An object started matching the query.
    Entered(T),
    /// An object stopped matching the query.
    Left(T),
    Created(T),
    /// A matching object changed; `original` is its previous state when the server sends it.
    Updated { object: T, original: Option<T> },
    Deleted(T),
}

impl<T> Event<T> {
    pub fn object(&self) -> &T {
        match self {
            Event::Entered(object)
            | Event::Left(object)
            | Event::Created(object)
            | Event::Deleted(object) => object,
            Event::Updated { object, .. } => object,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Entered(_) => EventKind::Enter,
            Event::Left(_) => EventKind::Leave,
            Event::Created(_) => EventKind::Create,
            Event::Updated { .. } => EventKind::Update,
            Event::Deleted(_) => EventKind::Delete,
        }
    }
}

/// The last thing a subscription observed. Each observation replaces the previous one.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionState<T> {
    Subscribed { is_new: bool },
    Unsubscribed,
    Event(Event<T>),
}

/// One item of a subscription's update stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate<T> {
    Subscribed { is_new: bool },
    Unsubscribed,
    Event(Event<T>),
    Error(ParseError),
}

/// What the client calls on a subscription while reconciling server messages.
pub(crate) trait SubscriptionHandler: Send + Sync {
    fn did_subscribe(&self, is_new: bool);

    fn did_unsubscribe(&self);

    fn did_receive(&self, kind: EventKind, event: EventResponse);

    fn did_fail(&self, error: ParseError);

    fn replace_query(&self, query: ParseQuery);
}

type SubscribeCallback = Arc<dyn Fn(&ParseQuery, bool) + Send + Sync>;
type UnsubscribeCallback = Arc<dyn Fn(&ParseQuery) + Send + Sync>;
type EventCallback<T> = Arc<dyn Fn(&ParseQuery, &Event<T>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ParseQuery, &ParseError) + Send + Sync>;

struct Callbacks<T> {
    subscribe: Option<SubscribeCallback>,
    unsubscribe: Option<UnsubscribeCallback>,
    event: Option<EventCallback<T>>,
    error: Option<ErrorCallback>,
}

struct SubscriptionInner<T> {
    request_id: RequestId,
    query: Mutex<ParseQuery>,
    state: Mutex<Option<SubscriptionState<T>>>,
    last_error: Mutex<Option<ParseError>>,
    callbacks: Mutex<Callbacks<T>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<SubscriptionUpdate<T>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one live query subscription, returned by
/// [`ParseLiveQuery::subscribe`](crate::live_query::ParseLiveQuery::subscribe).
///
/// The handle is available as soon as the subscription is registered; the server's
/// confirmation, object events and errors arrive later and can be consumed three ways:
/// - polling [`state`](Self::state), [`event`](Self::event) and [`error`](Self::error)
/// - registering callbacks with the `handle_*` methods
/// - reading the stream returned by [`updates`](Self::updates)
///
/// Event payloads are decoded into `T`; a payload that does not decode is reported as
/// an error on this subscription only.
pub struct Subscription<T> {
    inner: Arc<SubscriptionInner<T>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Subscription {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request_id", &self.inner.request_id)
            .field("query", &*lock(&self.inner.query))
            .finish()
    }
}

impl<T> Subscription<T> {
    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    /// The query most recently sent for this subscription.
    pub fn query(&self) -> ParseQuery {
        lock(&self.inner.query).clone()
    }
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(request_id: RequestId, query: ParseQuery) -> Self {
        Subscription {
            inner: Arc::new(SubscriptionInner {
                request_id,
                query: Mutex::new(query),
                state: Mutex::new(None),
                last_error: Mutex::new(None),
                callbacks: Mutex::new(Callbacks {
                    subscribe: None,
                    unsubscribe: None,
                    event: None,
                    error: None,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn SubscriptionHandler> {
        self.inner.clone()
    }

    pub fn state(&self) -> Option<SubscriptionState<T>> {
        lock(&self.inner.state).clone()
    }

    /// `Some(is_new)` if the last observation was a subscription confirmation.
    pub fn subscribed(&self) -> Option<bool> {
        match *lock(&self.inner.state) {
            Some(SubscriptionState::Subscribed { is_new }) => Some(is_new),
            _ => None,
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        matches!(
            *lock(&self.inner.state),
            Some(SubscriptionState::Unsubscribed)
        )
    }

    /// The latest event, if the last observation was an event.
    pub fn event(&self) -> Option<Event<T>> {
        match &*lock(&self.inner.state) {
            Some(SubscriptionState::Event(event)) => Some(event.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<ParseError> {
        lock(&self.inner.last_error).clone()
    }

    /// Calls `callback` with the query and the `is_new` flag on every confirmation.
    pub fn handle_subscribe<F>(&self, callback: F) -> &Self
    where
        F: Fn(&ParseQuery, bool) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).subscribe = Some(Arc::new(callback));
        self
    }

    pub fn handle_unsubscribe<F>(&self, callback: F) -> &Self
    where
        F: Fn(&ParseQuery) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).unsubscribe = Some(Arc::new(callback));
        self
    }

    pub fn handle_event<F>(&self, callback: F) -> &Self
    where
        F: Fn(&ParseQuery, &Event<T>) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).event = Some(Arc::new(callback));
        self
    }

    pub fn handle_error<F>(&self, callback: F) -> &Self
    where
        F: Fn(&ParseQuery, &ParseError) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).error = Some(Arc::new(callback));
        self
    }

    /// A stream of everything this subscription observes from now on.
    ///
    /// Every call returns an independent stream. Streams end after the server confirms
    /// the unsubscription.
    pub fn updates(&self) -> impl Stream<Item = SubscriptionUpdate<T>> + Send + 'static {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.listeners).push(sender);
        stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|update| (update, receiver))
        })
    }
}

impl<T: Clone> SubscriptionInner<T> {
    fn observe(&self, state: SubscriptionState<T>) {
        *lock(&self.state) = Some(state);
    }

    fn broadcast(&self, update: SubscriptionUpdate<T>) {
        lock(&self.listeners).retain(|listener| listener.send(update.clone()).is_ok());
    }

    fn current_query(&self) -> ParseQuery {
        lock(&self.query).clone()
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T, ParseError> {
    serde_json::from_value(payload).map_err(|e| {
        ParseError::JsonDeserializationFailed(format!("LiveQuery event object: {}", e))
    })
}

impl<T> SubscriptionHandler for SubscriptionInner<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn did_subscribe(&self, is_new: bool) {
        self.observe(SubscriptionState::Subscribed { is_new });
        let callback = lock(&self.callbacks).subscribe.clone();
        if let Some(callback) = callback {
            callback(&self.current_query(), is_new);
        }
        self.broadcast(SubscriptionUpdate::Subscribed { is_new });
    }

    fn did_unsubscribe(&self) {
        self.observe(SubscriptionState::Unsubscribed);
        let callback = lock(&self.callbacks).unsubscribe.clone();
        if let Some(callback) = callback {
            callback(&self.current_query());
        }
        self.broadcast(SubscriptionUpdate::Unsubscribed);
        // Dropping the senders ends every update stream.
        lock(&self.listeners).clear();
    }

    fn did_receive(&self, kind: EventKind, event: EventResponse) {
        let object = match decode_payload::<T>(event.object) {
            Ok(object) => object,
            Err(e) => {
                self.did_fail(e);
                return;
            }
        };
        let event = match kind {
            EventKind::Create => Event::Created(object),
            EventKind::Enter => Event::Entered(object),
            EventKind::Leave => Event::Left(object),
            EventKind::Delete => Event::Deleted(object),
            EventKind::Update => {
                let original = match event.original.map(decode_payload::<T>).transpose() {
                    Ok(original) => original,
                    Err(e) => {
                        self.did_fail(e);
                        return;
                    }
                };
                Event::Updated { object, original }
            }
        };

        self.observe(SubscriptionState::Event(event.clone()));
        let callback = lock(&self.callbacks).event.clone();
        if let Some(callback) = callback {
            callback(&self.current_query(), &event);
        }
        self.broadcast(SubscriptionUpdate::Event(event));
    }

    fn did_fail(&self, error: ParseError) {
        log::debug!(
            "LiveQuery subscription {} reported an error: {}",
            self.request_id,
            error
        );
        *lock(&self.last_error) = Some(error.clone());
        let callback = lock(&self.callbacks).error.clone();
        if let Some(callback) = callback {
            callback(&self.current_query(), &error);
        }
        self.broadcast(SubscriptionUpdate::Error(error));
    }

    fn replace_query(&self, query: ParseQuery) {
        *lock(&self.query) = query;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParseObject;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn subscription() -> Subscription<ParseObject> {
        Subscription::new(RequestId(1), ParseQuery::new("GameScore"))
    }

    fn event_response(object: Value) -> EventResponse {
        EventResponse {
            request_id: RequestId(1),
            object,
            original: None,
            client_id: Some("client".to_string()),
            installation_id: None,
        }
    }

    #[test]
    fn test_observations_replace_each_other() {
        let subscription = subscription();
        let handler = subscription.handler();

        handler.did_subscribe(true);
        assert_eq!(subscription.subscribed(), Some(true));
        assert!(subscription.event().is_none());

        handler.did_receive(
            EventKind::Create,
            event_response(json!({"className": "GameScore", "objectId": "a"})),
        );
        assert_eq!(subscription.subscribed(), None);
        assert!(matches!(subscription.event(), Some(Event::Created(_))));

        handler.did_unsubscribe();
        assert!(subscription.is_unsubscribed());
        assert!(subscription.event().is_none());

        handler.did_subscribe(false);
        assert!(!subscription.is_unsubscribed());
        assert_eq!(subscription.subscribed(), Some(false));
    }

    #[test]
    fn test_undecodable_payload_is_reported_as_error() {
        let subscription: Subscription<u32> =
            Subscription::new(RequestId(1), ParseQuery::new("GameScore"));
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        subscription.handle_error(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        subscription
            .handler()
            .did_receive(EventKind::Create, event_response(json!({"objectId": "a"})));

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(matches!(
            subscription.error(),
            Some(ParseError::JsonDeserializationFailed(_))
        ));
        assert!(subscription.event().is_none());
    }

    #[test]
    fn test_update_event_carries_original() {
        let subscription = subscription();
        let mut response = event_response(json!({"objectId": "a", "points": 2}));
        response.original = Some(json!({"objectId": "a", "points": 1}));
        subscription.handler().did_receive(EventKind::Update, response);

        match subscription.event() {
            Some(Event::Updated { object, original }) => {
                assert_eq!(object.get::<i64>("points"), Some(2));
                assert_eq!(original.and_then(|o| o.get::<i64>("points")), Some(1));
            }
            other => panic!("expected update event, got {:?}", other),
        }
    }

    #[test]
    fn test_callbacks_receive_current_query() {
        let subscription = subscription();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        subscription.handle_subscribe(move |query, is_new| {
            lock(&record).push((query.class_name().to_string(), is_new));
        });

        subscription
            .handler()
            .replace_query(ParseQuery::new("PlayerScore"));
        subscription.handler().did_subscribe(false);

        assert_eq!(*lock(&seen), vec![("PlayerScore".to_string(), false)]);
        assert_eq!(subscription.query().class_name(), "PlayerScore");
    }

    #[tokio::test]
    async fn test_updates_stream_ends_after_unsubscribe() {
        let subscription = subscription();
        let first = subscription.updates();
        let second = subscription.updates();
        let handler = subscription.handler();

        handler.did_subscribe(true);
        handler.did_receive(EventKind::Delete, event_response(json!({"objectId": "a"})));
        handler.did_unsubscribe();

        let first: Vec<_> = first.collect().await;
        let second: Vec<_> = second.collect().await;
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(first[0], SubscriptionUpdate::Subscribed { is_new: true });
        assert!(matches!(
            first[1],
            SubscriptionUpdate::Event(Event::Deleted(_))
        ));
        assert_eq!(first[2], SubscriptionUpdate::Unsubscribed);
    }
}
