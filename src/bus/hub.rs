//! Fan-out of bus events to subscription handles.
//!
//! Every subscriber gets its own unbounded queue so a slow reader never
//! causes events to be dropped or reordered for anyone else. Publishing
//! happens from worker threads and caller tasks alike and never blocks.

use super::events::{BusEvent, EventFilter, EventTopic};
use futures::stream::{self, Stream};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct Subscriber {
    topic: EventTopic,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, topic: EventTopic, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .insert(id, Subscriber { topic, filter, tx });
        tracing::debug!("Subscription {} attached to {}", id, topic);
        Subscription {
            id,
            topic,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.topic != topic || !subscriber.filter.matches(&event) {
                    continue;
                }
                if subscriber.tx.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    /// Returns whether the subscription was still attached.
    pub fn remove(&self, id: u64) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("Subscription {} released", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Handle to one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: EventTopic,
    rx: mpsc::UnboundedReceiver<BusEvent>,
    hub: Weak<EventHub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> EventTopic {
        self.topic
    }

    /// Next event; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn into_stream(self) -> impl Stream<Item = BusEvent> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut subscription| async move {
            subscription
                .rx
                .recv()
                .await
                .map(|event| (event, subscription))
        }))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionStatus;
    use futures::StreamExt;

    fn status(connection: &str) -> BusEvent {
        BusEvent::ConnectionStatus {
            connection_id: connection.to_string(),
            status: ConnectionStatus::Connecting,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_delivery_respects_topic_and_filter() {
        let hub = EventHub::new();
        let mut all = hub.subscribe(EventTopic::ConnectionStatus, EventFilter::default());
        let mut only_b = hub.subscribe(EventTopic::ConnectionStatus, EventFilter::connection("b"));
        let mut shells = hub.subscribe(EventTopic::ShellData, EventFilter::default());

        hub.publish(status("a"));
        hub.publish(status("b"));

        assert_eq!(all.recv().await.unwrap().connection_id(), "a");
        assert_eq!(all.recv().await.unwrap().connection_id(), "b");
        assert_eq!(only_b.recv().await.unwrap().connection_id(), "b");
        assert!(only_b.try_recv().is_none());
        assert!(shells.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let hub = EventHub::new();
        let subscription = hub.subscribe(EventTopic::ShellExit, EventFilter::default());
        assert_eq!(hub.subscriber_count(), 1);
        subscription.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(status("a"));
    }

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let hub = EventHub::new();
        let stream = hub
            .subscribe(EventTopic::ConnectionStatus, EventFilter::default())
            .into_stream();
        for id in ["1", "2", "3"] {
            hub.publish(status(id));
        }
        let ids: Vec<String> = stream
            .take(3)
            .map(|event| event.connection_id().to_string())
            .collect()
            .await;
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
