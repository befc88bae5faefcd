//! # Notification Bus
//!
//! Process-wide publish/subscribe channel for resource events. Topics are resource names
//! such as `/importers`; each topic is a `tokio::sync::broadcast` channel created on first
//! subscription. A second channel carries every event regardless of topic.
//!
//! Delivery is fire-and-forget: publishing to a topic nobody listens to is not an error,
//! and a subscriber that falls more than `channel_capacity` events behind loses the oldest
//! ones (`RecvError::Lagged`).

use api_workers::{Notification, NotificationSink};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub struct NotificationBus {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
    all: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
            all,
        }
    }

    /// Receives every event published on `resource` from now on.
    pub fn subscribe(&self, resource: &str) -> broadcast::Receiver<Notification> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(resource.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receives every event on every topic from now on.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Publishes one event. Returns how many subscribers it reached.
    pub fn publish(&self, resource: &str, event: &str, data: Value) -> usize {
        let notification = Notification::new(resource, event, data);
        let topic = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics.get(resource).cloned()
        };

        let mut delivered = 0;
        if let Some(topic) = topic {
            delivered += topic.send(notification.clone()).unwrap_or(0);
        }
        delivered += self.all.send(notification).unwrap_or(0);

        if delivered == 0 {
            trace!(resource, event, "Notification published without subscribers");
        } else {
            debug!(resource, event, delivered, "Notification published");
        }
        delivered
    }

    pub fn topics(&self) -> Vec<String> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for NotificationBus {
    fn publish(&self, resource: &str, event: &str, data: Value) {
        NotificationBus::publish(self, resource, event, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn topic_subscribers_only_see_their_topic() {
        let bus = NotificationBus::new(8);
        let mut importers = bus.subscribe("/importers");
        let mut tags = bus.subscribe("/tags");

        assert_eq!(bus.publish("/importers", "import.started", json!({"id": 1})), 1);

        let n = importers.recv().await.unwrap();
        assert_eq!(n.resource, "/importers");
        assert_eq!(n.event, "import.started");
        assert_eq!(n.data, json!({"id": 1}));
        assert!(matches!(tags.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_topic() {
        let bus = NotificationBus::default();
        let mut everything = bus.subscribe_all();
        let _importers = bus.subscribe("/importers");

        assert_eq!(bus.publish("/importers", "import.started", Value::Null), 2);
        assert_eq!(bus.publish("/storage/synchronizers", "synchronizer.created", Value::Null), 1);

        assert_eq!(everything.recv().await.unwrap().resource, "/importers");
        assert_eq!(
            everything.recv().await.unwrap().event,
            "synchronizer.created"
        );
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = NotificationBus::new(4);
        assert_eq!(bus.publish("/tags", "tag.created", json!({})), 0);
        assert!(bus.topics().is_empty());
    }

    #[tokio::test]
    async fn slow_subscribers_lag_instead_of_blocking() {
        let bus = NotificationBus::new(2);
        let mut slow = bus.subscribe("/images");
        for i in 0..5 {
            bus.publish("/images", "image.created", json!(i));
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap().data, json!(3));
    }
}
