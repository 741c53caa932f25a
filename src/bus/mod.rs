//! Topic-based publish/subscribe used between stages
//!
//! Stages only see the [`MessageBus`] trait. [`InMemoryBus`] runs the whole
//! pipeline inside one process; a broker-backed bus would implement the same
//! trait.

pub mod memory;
pub mod topics;

use async_trait::async_trait;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::InMemoryBus;
pub use topics::{entity_segment, topic_matches, Topics};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("subscriber lagged by {0} messages (messages were dropped)")]
    Lagged(u64),

    #[error("invalid publish topic {0:?}")]
    InvalidTopic(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    /// Subscribe to every topic matching any of `filters`.
    /// Retained messages matching a filter are delivered first.
    async fn subscribe(&self, filters: &[String]) -> Result<Subscription, BusError>;
}

/// Filtered view over the bus feed
pub struct Subscription {
    filters: Vec<String>,
    retained: VecDeque<BusMessage>,
    receiver: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(
        filters: Vec<String>,
        retained: VecDeque<BusMessage>,
        receiver: broadcast::Receiver<BusMessage>,
    ) -> Self {
        Self {
            filters,
            retained,
            receiver,
        }
    }

    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }

    /// Next matching message; `Lagged` is reported once and the
    /// subscription keeps working
    pub async fn recv(&mut self) -> Result<BusMessage, BusError> {
        if let Some(message) = self.retained.pop_front() {
            return Ok(message);
        }

        loop {
            let message = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => BusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    log::warn!("Subscriber lagged by {} messages", n);
                    BusError::Lagged(n)
                }
            })?;

            if self.wants(&message.topic) {
                return Ok(message);
            }
        }
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }
}
