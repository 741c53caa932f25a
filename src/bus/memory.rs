//! In-process bus over a tokio broadcast channel

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::topics::{is_valid_topic, topic_matches};
use super::{BusError, BusMessage, MessageBus, Subscription};

#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<broadcast::Sender<BusMessage>>>,
    /// Last retained message per topic
    retained: Mutex<BTreeMap<String, BusMessage>>,
}

impl InMemoryBus {
    /// `capacity` is how many messages a slow subscriber may fall behind
    /// before it starts losing the oldest ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                retained: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Drop the sender; subscribers drain what is buffered and then see `Closed`
    pub fn close(&self) {
        self.inner.sender.lock().take();
    }

    pub fn retained(&self, topic: &str) -> Option<BusMessage> {
        self.inner.retained.lock().get(topic).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .sender
            .lock()
            .as_ref()
            .map_or(0, |s| s.receiver_count())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if !is_valid_topic(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            retain,
        };

        let sender = self.inner.sender.lock().clone().ok_or(BusError::Closed)?;

        if retain {
            self.inner
                .retained
                .lock()
                .insert(topic.to_string(), message.clone());
        }

        if sender.send(message).is_err() {
            log::trace!("No subscribers for {}", topic);
        }
        Ok(())
    }

    async fn subscribe(&self, filters: &[String]) -> Result<Subscription, BusError> {
        // Take the receiver before snapshotting retained messages so nothing
        // published in between is missed
        let receiver = self
            .inner
            .sender
            .lock()
            .as_ref()
            .ok_or(BusError::Closed)?
            .subscribe();

        let retained: VecDeque<BusMessage> = self
            .inner
            .retained
            .lock()
            .values()
            .filter(|m| filters.iter().any(|f| topic_matches(f, &m.topic)))
            .cloned()
            .collect();

        Ok(Subscription::new(filters.to_vec(), retained, receiver))
    }
}
