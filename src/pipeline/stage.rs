//! The contract every pipeline stage implements

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StageError;
use crate::messages::{Capabilities, Timestamp};

/// A message a stage wants published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Outbound {
    /// Non-retained message carrying an already validated JSON document
    pub fn json(topic: String, value: &Value) -> Self {
        Self {
            topic,
            payload: value.to_string().into_bytes(),
            retain: false,
        }
    }
}

/// One long-lived worker on the bus
///
/// `handle` either returns what to publish or says why the message was
/// dropped. Workers log the drop and keep going; nothing a single message
/// does can stop a stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn agent_id(&self) -> &str;

    /// Topic filters this stage consumes
    fn subscriptions(&self) -> Vec<String>;

    /// Announced in heartbeats
    fn capabilities(&self) -> Capabilities;

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<Outbound>, StageError>;

    /// Periodic maintenance on the worker's housekeeping tick
    fn housekeeping(&self, _now: Timestamp) {}
}

/// Snapshot of a worker's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub dropped: u64,
    pub published: u64,
}

/// Counters shared between a worker and its shards
#[derive(Debug, Default)]
pub struct StageCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
}

impl StageCounters {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages the bus discarded before this worker could receive them
    pub fn record_lagged(&self, skipped: u64) {
        self.dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}
