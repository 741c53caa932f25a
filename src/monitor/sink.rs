//! Observability Sink: watches contexts, confirmations and heartbeats
//!
//! Nothing downstream depends on it. Messages that fail their contract are
//! dropped like anywhere else, but the sink never publishes.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::index::{CorrelationMatch, RecentContextIndex};
use crate::bus::Topics;
use crate::contracts::{
    ContractRegistry, ACTION_CONFIRMATION, AGENT_HEARTBEAT, PROCESSED_MACHINE_CONTEXT,
};
use crate::error::StageError;
use crate::messages::{
    AgentStatus, CapabilityRef, Capabilities, ConfirmationMessage, ContextMessage,
    HeartbeatMessage, Timestamp, CONFIRMATION_TYPE, CONTEXT_TYPE,
};
use crate::pipeline::{Outbound, Stage};

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub agent_id: String,
    pub retention: Duration,
}

/// What the sink made of one message
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    ContextStored {
        entity_id: String,
        context_id: String,
    },
    ActionConfirmed {
        entity_id: String,
        decision_id: String,
        /// `None` when no recent context exists for the machine
        context_id: Option<String>,
        matched: Option<CorrelationMatch>,
    },
    AgentSeen {
        agent_id: String,
        status: AgentStatus,
    },
    Ignored,
}

pub struct ObservabilitySink {
    registry: Arc<ContractRegistry>,
    topics: Topics,
    settings: SinkSettings,
    contexts: Mutex<RecentContextIndex>,
    agents: Mutex<BTreeMap<String, HeartbeatMessage>>,
}

impl ObservabilitySink {
    pub fn new(registry: Arc<ContractRegistry>, topics: Topics, settings: SinkSettings) -> Self {
        let contexts = Mutex::new(RecentContextIndex::new(settings.retention));
        Self {
            registry,
            topics,
            settings,
            contexts,
            agents: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record one context, confirmation or heartbeat
    ///
    /// # Arguments
    /// * `topic` - Topic the message arrived on; decides how it is read
    /// * `payload` - Message as JSON bytes
    ///
    /// # Returns
    /// What the sink did with the message. Confirmations are correlated to
    /// their originating context by `context_id` when present, otherwise to
    /// the nearest preceding context for the same machine.
    pub fn observe(&self, topic: &str, payload: &[u8]) -> Result<SinkEvent, StageError> {
        if self.topics.is_heartbeat(topic) {
            let heartbeat: HeartbeatMessage =
                self.accept(topic, payload, AGENT_HEARTBEAT, "/agent_id")?;
            log::debug!(
                "[{}] agent {} is {:?}",
                self.settings.agent_id,
                heartbeat.agent_id,
                heartbeat.status
            );
            let event = SinkEvent::AgentSeen {
                agent_id: heartbeat.agent_id.clone(),
                status: heartbeat.status,
            };
            self.agents
                .lock()
                .insert(heartbeat.agent_id.clone(), heartbeat);
            return Ok(event);
        }

        if self.topics.is_context(topic) {
            let context: ContextMessage =
                self.accept(topic, payload, PROCESSED_MACHINE_CONTEXT, "/payload/machine_id")?;
            let event = SinkEvent::ContextStored {
                entity_id: context.payload.entity_id.clone(),
                context_id: context.context_id.clone(),
            };
            self.contexts.lock().insert(context);
            return Ok(event);
        }

        if self.topics.is_actions(topic) {
            let confirmation: ConfirmationMessage =
                self.accept(topic, payload, ACTION_CONFIRMATION, "/payload/machine_id")?;
            return Ok(self.record_confirmation(confirmation));
        }

        Ok(SinkEvent::Ignored)
    }

    fn record_confirmation(&self, confirmation: ConfirmationMessage) -> SinkEvent {
        let entity = confirmation.payload.entity_id;
        let contexts = self.contexts.lock();
        let correlated = contexts.correlate(
            &entity,
            confirmation.payload.context_id.as_deref(),
            confirmation.timestamp,
        );

        match correlated {
            Some((context, matched)) => {
                log::info!(
                    "[{}] {} {:?}/{:?} for decision {} <- context {} \
                     (avg temp {:.2}, anomaly {}, {:?})",
                    self.settings.agent_id,
                    entity,
                    confirmation.payload.action_taken,
                    confirmation.payload.status,
                    confirmation.payload.decision_id,
                    context.context_id,
                    context.payload.avg_temperature,
                    context.payload.is_anomaly,
                    matched
                );
                SinkEvent::ActionConfirmed {
                    entity_id: entity.clone(),
                    decision_id: confirmation.payload.decision_id,
                    context_id: Some(context.context_id.clone()),
                    matched: Some(matched),
                }
            }
            None => {
                log::info!(
                    "[{}] {} {:?}/{:?} for decision {} (no recent context)",
                    self.settings.agent_id,
                    entity,
                    confirmation.payload.action_taken,
                    confirmation.payload.status,
                    confirmation.payload.decision_id
                );
                SinkEvent::ActionConfirmed {
                    entity_id: entity.clone(),
                    decision_id: confirmation.payload.decision_id,
                    context_id: None,
                    matched: None,
                }
            }
        }
    }

    /// Parse, check identity, validate and version-check an inbound message
    fn accept<T: DeserializeOwned>(
        &self,
        topic: &str,
        payload: &[u8],
        contract: &'static str,
        identity: &str,
    ) -> Result<T, StageError> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| StageError::Malformed {
            topic: topic.to_string(),
            detail: e.to_string(),
        })?;

        let entity = value
            .pointer(identity)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StageError::MissingIdentity {
                topic: topic.to_string(),
            })?
            .to_string();

        let inbound = |source| StageError::InboundContract {
            contract,
            entity: entity.clone(),
            source,
        };
        self.registry.validate(&value, contract).map_err(inbound)?;
        // Heartbeats carry their version per capability, not at the top level
        if contract != AGENT_HEARTBEAT {
            self.registry
                .check_supported_version(&value, contract)
                .map_err(inbound)?;
        }

        serde_json::from_value(value).map_err(|e| StageError::Malformed {
            topic: topic.to_string(),
            detail: e.to_string(),
        })
    }

    /// Last heartbeat per agent
    pub fn agents(&self) -> BTreeMap<String, HeartbeatMessage> {
        self.agents.lock().clone()
    }

    pub fn tracked_contexts(&self, entity_id: &str) -> usize {
        self.contexts.lock().len(entity_id)
    }

    pub fn sweep(&self, now: Timestamp) -> usize {
        self.contexts.lock().sweep(now)
    }
}

#[async_trait]
impl Stage for ObservabilitySink {
    fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![
            self.topics.context_filter(),
            self.topics.actions_filter(),
            self.topics.heartbeat().to_string(),
        ]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            consumes: vec![
                CapabilityRef::new(
                    CONTEXT_TYPE,
                    self.registry.version_of(PROCESSED_MACHINE_CONTEXT),
                ),
                CapabilityRef::new(
                    CONFIRMATION_TYPE,
                    self.registry.version_of(ACTION_CONFIRMATION),
                ),
            ],
            produces: Vec::new(),
        }
    }

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<Outbound>, StageError> {
        self.observe(topic, payload)?;
        Ok(Vec::new())
    }

    fn housekeeping(&self, now: Timestamp) {
        let dropped = self.sweep(now);
        if dropped > 0 {
            log::debug!("[{}] swept {} stale contexts", self.settings.agent_id, dropped);
        }

        let agents = self.agents.lock();
        let online = agents
            .values()
            .filter(|hb| hb.status == AgentStatus::Online)
            .count();
        log::info!(
            "[{}] topology: {} agents known, {} online",
            self.settings.agent_id,
            agents.len(),
            online
        );
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            agent_id: "performance_monitor_001".to_string(),
            retention: Duration::minutes(5),
        }
    }
}
