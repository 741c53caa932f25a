//! Recent contexts per machine, for correlating confirmations back to the
//! context that caused them

use chrono::Duration;
use std::collections::{HashMap, VecDeque};

use crate::messages::{ContextMessage, Timestamp};

/// How a confirmation was tied to a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMatch {
    /// Carried `context_id` found in the index
    Linked,
    /// No link; closest context at or before the confirmation
    Nearest,
}

pub struct RecentContextIndex {
    horizon: Duration,
    contexts: HashMap<String, VecDeque<ContextMessage>>,
}

impl RecentContextIndex {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            contexts: HashMap::new(),
        }
    }

    /// Insert and prune this machine's entries older than the horizon,
    /// measured from the new context's timestamp
    pub fn insert(&mut self, context: ContextMessage) {
        let cutoff = context.timestamp - self.horizon;
        let entries = self
            .contexts
            .entry(context.payload.entity_id.clone())
            .or_default();
        entries.retain(|c| c.timestamp >= cutoff);
        entries.push_back(context);
    }

    /// Prune every machine; returns how many contexts were dropped
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        let cutoff = now - self.horizon;
        let mut dropped = 0;
        self.contexts.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|c| c.timestamp >= cutoff);
            dropped += before - entries.len();
            !entries.is_empty()
        });
        dropped
    }

    /// Find the context behind a confirmation
    ///
    /// A carried `context_id` is authoritative. Without one, fall back to the
    /// latest context for the machine at or before `at`, or the earliest one
    /// when every context is newer.
    ///
    /// # Arguments
    /// * `entity_id` - Machine the confirmation is about
    /// * `context_id` - The confirmation's `payload.context_id`, if it has one
    /// * `at` - The confirmation's timestamp
    ///
    /// # Returns
    /// The matched context and how it was found, or `None` when nothing is
    /// tracked for the machine
    pub fn correlate(
        &self,
        entity_id: &str,
        context_id: Option<&str>,
        at: Timestamp,
    ) -> Option<(&ContextMessage, CorrelationMatch)> {
        let entries = self.contexts.get(entity_id)?;

        if let Some(id) = context_id {
            if let Some(found) = entries.iter().find(|c| c.context_id == id) {
                return Some((found, CorrelationMatch::Linked));
            }
        }

        entries
            .iter()
            .rev()
            .find(|c| c.timestamp <= at)
            .or_else(|| entries.front())
            .map(|c| (c, CorrelationMatch::Nearest))
    }

    pub fn len(&self, entity_id: &str) -> usize {
        self.contexts.get(entity_id).map_or(0, VecDeque::len)
    }

    pub fn entity_count(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ContextPayload, MachineStatus, Metadata, Priority, CONTEXT_TYPE};
    use chrono::{TimeZone, Utc};

    fn base() -> Timestamp {
        Utc.timestamp_opt(1_714_564_800, 0).unwrap()
    }

    fn context(id: &str, entity: &str, offset_secs: i64) -> ContextMessage {
        ContextMessage {
            context_id: id.to_string(),
            timestamp: base() + Duration::seconds(offset_secs),
            source_agent_id: "context_modeling_engine_001".to_string(),
            context_type: CONTEXT_TYPE.to_string(),
            schema_version: "1.0.0".to_string(),
            payload: ContextPayload {
                entity_id: entity.to_string(),
                current_status: MachineStatus::Running,
                avg_temperature: 40.0,
                max_vibration: 0.5,
                avg_power: 10.0,
                is_anomaly: false,
            },
            metadata: Metadata {
                priority: Priority::Normal,
                ttl_seconds: 60,
            },
        }
    }

    #[test]
    fn test_insert_prunes_same_entity_only() {
        let mut index = RecentContextIndex::new(Duration::minutes(5));
        index.insert(context("a1", "A", 0));
        index.insert(context("b1", "B", 0));
        index.insert(context("a2", "A", 400));

        assert_eq!(index.len("A"), 1);
        // B had no insert, so its stale entry survives until a sweep
        assert_eq!(index.len("B"), 1);

        assert_eq!(index.sweep(base() + Duration::seconds(400)), 1);
        assert_eq!(index.len("B"), 0);
        assert_eq!(index.entity_count(), 1);
    }

    #[test]
    fn test_correlate_by_id_first() {
        let mut index = RecentContextIndex::new(Duration::minutes(5));
        index.insert(context("c1", "A", 0));
        index.insert(context("c2", "A", 10));
        index.insert(context("c3", "A", 20));

        let (found, how) = index
            .correlate("A", Some("c1"), base() + Duration::seconds(21))
            .unwrap();
        assert_eq!(found.context_id, "c1");
        assert_eq!(how, CorrelationMatch::Linked);
    }

    #[test]
    fn test_correlate_falls_back_to_nearest_preceding() {
        let mut index = RecentContextIndex::new(Duration::minutes(5));
        index.insert(context("c1", "A", 0));
        index.insert(context("c2", "A", 10));
        index.insert(context("c3", "A", 20));

        let (found, how) = index
            .correlate("A", None, base() + Duration::seconds(15))
            .unwrap();
        assert_eq!(found.context_id, "c2");
        assert_eq!(how, CorrelationMatch::Nearest);

        // Unknown id degrades to the time-based guess
        let (found, how) = index
            .correlate("A", Some("gone"), base() + Duration::seconds(25))
            .unwrap();
        assert_eq!(found.context_id, "c3");
        assert_eq!(how, CorrelationMatch::Nearest);

        let (found, _) = index.correlate("A", None, base() - Duration::seconds(5)).unwrap();
        assert_eq!(found.context_id, "c1");

        assert!(index.correlate("Z", None, base()).is_none());
    }
}
