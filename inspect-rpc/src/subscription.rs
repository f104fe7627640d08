//! Event subscriptions made over websocket connections, and their cleanup.
//!
//! Subscriptions are keyed by the subscriber's remote address, so everything a connection
//! subscribed to can be dropped in one call when it goes away.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use inspect_jsonrpc::JsonValue;
use serde::Serialize;

use crate::error::SubscriptionError;

/// An event published on the bus.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub data: JsonValue,
    /// Composite event attributes (`tx.height`, `tm.event`, ...) and their values.
    pub events: BTreeMap<String, Vec<String>>,
}

/// Publish/subscribe service the websocket sessions subscribe through.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Subscribe `subscriber` to the events matching `query`.  `capacity` bounds how many events
    /// may be buffered for the subscriber.
    async fn subscribe(
        &self,
        subscriber: &str,
        query: &str,
        capacity: usize,
    ) -> Result<BoxStream<'static, Event>, SubscriptionError>;

    async fn unsubscribe(&self, subscriber: &str, query: &str) -> Result<(), SubscriptionError>;

    /// Drop every subscription of `subscriber`.  Fails with [`SubscriptionError::NotFound`] if it
    /// had none.
    async fn unsubscribe_all(&self, subscriber: &str) -> Result<(), SubscriptionError>;
}

/// An in-process event bus.  Queries are matched by exact string comparison.
///
/// An inspection server has no consensus engine producing events, so in production this bus
/// usually stays silent; it still gives websocket clients the subscription semantics they
/// expect.
#[derive(Default)]
pub struct LocalEventBus {
    subscribers: Mutex<HashMap<String, HashMap<String, mpsc::Sender<Event>>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to everyone subscribed to `query`.  Returns the number of subscribers it
    /// was delivered to.
    ///
    /// A subscriber whose buffer is full misses the event.
    pub fn publish(&self, query: &str, event: Event) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;

        for (subscriber, queries) in subscribers.iter_mut() {
            let Some(sender) = queries.get_mut(query) else {
                continue;
            };

            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) if e.is_full() => {
                    tracing::warn!(subscriber = %subscriber, query, "Subscriber is not keeping up; event dropped");
                }
                Err(_) => {
                    // Receiver went away without unsubscribing
                    queries.remove(query);
                }
            }
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|queries| !queries.is_empty())
            .count()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn subscribe(
        &self,
        subscriber: &str,
        query: &str,
        capacity: usize,
    ) -> Result<BoxStream<'static, Event>, SubscriptionError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let queries = subscribers.entry(subscriber.to_string()).or_default();

        if queries.contains_key(query) {
            return Err(SubscriptionError::AlreadySubscribed {
                query: query.to_string(),
            });
        }

        // mpsc::channel adds one slot of its own per sender
        let (sender, receiver) = mpsc::channel(capacity.saturating_sub(1));
        queries.insert(query.to_string(), sender);

        Ok(receiver.boxed())
    }

    async fn unsubscribe(&self, subscriber: &str, query: &str) -> Result<(), SubscriptionError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);

        subscribers
            .get_mut(subscriber)
            .and_then(|queries| queries.remove(query))
            .map(|_| ())
            .ok_or(SubscriptionError::NotFound)
    }

    async fn unsubscribe_all(&self, subscriber: &str) -> Result<(), SubscriptionError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);

        match subscribers.remove(subscriber) {
            Some(queries) if !queries.is_empty() => Ok(()),
            _ => Err(SubscriptionError::NotFound),
        }
    }
}

/// Releases the subscriptions of a websocket connection when it disconnects.
#[derive(Clone)]
pub struct SubscriptionCleanup {
    event_bus: Arc<dyn EventBus>,
}

impl SubscriptionCleanup {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self { event_bus }
    }

    /// Drop every subscription held by `remote_addr`.
    ///
    /// Never fails: a connection that never subscribed is not an error, and any other failure is
    /// logged and then ignored so the disconnect can complete.
    pub async fn on_disconnect(&self, remote_addr: &str) {
        match self.event_bus.unsubscribe_all(remote_addr).await {
            Ok(()) | Err(SubscriptionError::NotFound) => {}
            Err(err) => {
                tracing::error!(addr = %remote_addr, %err, "Failed to unsubscribe addr from events");
            }
        }
    }
}
