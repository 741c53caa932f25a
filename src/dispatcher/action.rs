//! Action Dispatcher: decision in, exactly one confirmation out

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use super::executor::{ActionExecutor, DecisionKind};
use crate::bus::Topics;
use crate::contracts::{ContractRegistry, ACTION_CONFIRMATION, MAINTENANCE_DECISION};
use crate::error::StageError;
use crate::messages::{
    new_id, ActionTaken, CapabilityRef, Capabilities, ConfirmationMessage, ConfirmationPayload,
    DecisionMessage, Metadata, Priority, Timestamp, CONFIRMATION_TYPE, MAINTENANCE_DECISION_TYPE,
};
use crate::pipeline::{Outbound, Stage};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub agent_id: String,
    pub ttl_secs: u64,
}

pub struct ActionDispatcher {
    registry: Arc<ContractRegistry>,
    topics: Topics,
    executor: Arc<dyn ActionExecutor>,
    settings: DispatcherSettings,
    now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl ActionDispatcher {
    pub fn new(
        registry: Arc<ContractRegistry>,
        topics: Topics,
        executor: Arc<dyn ActionExecutor>,
        settings: DispatcherSettings,
    ) -> Self {
        Self::new_with_timestamp_fn(registry, topics, executor, settings, Box::new(Utc::now))
    }

    /// Constructor with an injectable clock (for testing)
    pub fn new_with_timestamp_fn(
        registry: Arc<ContractRegistry>,
        topics: Topics,
        executor: Arc<dyn ActionExecutor>,
        settings: DispatcherSettings,
        now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            topics,
            executor,
            settings,
            now_fn,
        }
    }

    /// Execute one serialized decision and build its confirmation
    ///
    /// # Arguments
    /// * `topic` - Topic the decision arrived on (used in error reports)
    /// * `payload` - Decision message as JSON bytes
    ///
    /// # Returns
    /// The actions topic for the machine and the validated confirmation.
    /// Unknown decision types are dropped before the executor runs.
    pub async fn dispatch(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(String, Value), StageError> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| StageError::Malformed {
            topic: topic.to_string(),
            detail: e.to_string(),
        })?;

        let entity = value
            .pointer("/payload/machine_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StageError::MissingIdentity {
                topic: topic.to_string(),
            })?
            .to_string();

        let inbound = |source| StageError::InboundContract {
            contract: MAINTENANCE_DECISION,
            entity: entity.clone(),
            source,
        };
        self.registry
            .validate(&value, MAINTENANCE_DECISION)
            .map_err(inbound)?;
        self.registry
            .check_supported_version(&value, MAINTENANCE_DECISION)
            .map_err(inbound)?;

        let decision_type = value
            .get("decision_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(kind) = DecisionKind::parse(decision_type) else {
            return Err(StageError::UnknownType {
                kind: "decision",
                found: decision_type.to_string(),
                entity,
            });
        };

        let decision: DecisionMessage =
            serde_json::from_value(value).map_err(|e| StageError::Malformed {
                topic: topic.to_string(),
                detail: e.to_string(),
            })?;

        let outcome = self.executor.execute(kind, &decision.payload).await;
        let action_taken = ActionTaken::from_decision(decision.payload.needs_action);

        let confirmation = ConfirmationMessage {
            confirmation_id: new_id(),
            timestamp: (self.now_fn)(),
            source_agent_id: self.settings.agent_id.clone(),
            confirmation_type: CONFIRMATION_TYPE.to_string(),
            schema_version: self.registry.version_of(ACTION_CONFIRMATION),
            payload: ConfirmationPayload {
                entity_id: entity.clone(),
                decision_id: decision.decision_id,
                context_id: decision.payload.context_id,
                action_taken,
                status: outcome.status,
                details: outcome.details,
            },
            metadata: Metadata {
                priority: Priority::Normal,
                ttl_seconds: self.settings.ttl_secs,
            },
        };

        let out = self
            .registry
            .validate_outbound(&confirmation)
            .map_err(|source| StageError::OutboundContract {
                contract: ACTION_CONFIRMATION,
                entity: entity.clone(),
                source,
            })?;

        log::info!(
            "[{}] {} for {}: {:?} ({:?})",
            self.settings.agent_id,
            kind.as_str(),
            entity,
            action_taken,
            confirmation.payload.status
        );

        Ok((self.topics.actions(&entity), out))
    }
}

#[async_trait]
impl Stage for ActionDispatcher {
    fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![self.topics.decision_filter()]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            consumes: vec![CapabilityRef::new(
                MAINTENANCE_DECISION_TYPE,
                self.registry.version_of(MAINTENANCE_DECISION),
            )],
            produces: vec![CapabilityRef::new(
                CONFIRMATION_TYPE,
                self.registry.version_of(ACTION_CONFIRMATION),
            )],
        }
    }

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<Outbound>, StageError> {
        let (out_topic, confirmation) = self.dispatch(topic, payload).await?;
        Ok(vec![Outbound::json(out_topic, &confirmation)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::dispatcher::executor::{ActionOutcome, SimulatedExecutor};
    use crate::messages::{ActionStatus, DecisionPayload};
    use serde_json::json;

    fn dispatcher_with(executor: Arc<dyn ActionExecutor>) -> ActionDispatcher {
        ActionDispatcher::new(
            Arc::new(ContractRegistry::builtin().unwrap()),
            Topics::new(TopicConfig::default()),
            executor,
            DispatcherSettings {
                agent_id: "action_executor_001".to_string(),
                ttl_secs: 30,
            },
        )
    }

    fn dispatcher() -> ActionDispatcher {
        dispatcher_with(Arc::new(SimulatedExecutor))
    }

    fn decision(decision_type: &str, needs_maintenance: bool, version: &str) -> Vec<u8> {
        json!({
            "decision_id": "dec-7",
            "timestamp": "2024-05-01T12:00:01Z",
            "source_agent_id": "predictive_maintenance_agent_001",
            "decision_type": decision_type,
            "schema_version": version,
            "payload": {
                "machine_id": "CNC001",
                "needs_maintenance": needs_maintenance,
                "prediction_confidence": 0.93,
                "predicted_features": {"avg_temperature_c_5min": 77.67},
                "context_id": "ctx-42"
            },
            "metadata": {"priority": "high", "ttl_seconds": 30}
        })
        .to_string()
        .into_bytes()
    }

    const TOPIC: &str = "decision/maintenance/CNC001";

    #[tokio::test]
    async fn test_positive_decision_initiates_action() {
        let (topic, confirmation) = dispatcher()
            .dispatch(TOPIC, &decision("maintenance_decision", true, "1.0.0"))
            .await
            .unwrap();

        assert_eq!(topic, "simulated_actions/CNC001");
        assert_eq!(confirmation["confirmation_type"], "action_confirmation");
        assert_eq!(confirmation["payload"]["decision_id"], "dec-7");
        assert_eq!(confirmation["payload"]["context_id"], "ctx-42");
        assert_eq!(confirmation["payload"]["action_taken"], "initiated");
        assert_eq!(confirmation["payload"]["status"], "success");
        assert_eq!(confirmation["metadata"]["ttl_seconds"], 30);
    }

    #[tokio::test]
    async fn test_negative_decision_still_confirmed() {
        let (_, confirmation) = dispatcher()
            .dispatch(TOPIC, &decision("maintenance_decision", false, "1.0.0"))
            .await
            .unwrap();
        assert_eq!(confirmation["payload"]["action_taken"], "no_action_taken");
        assert_eq!(confirmation["payload"]["status"], "success");
    }

    #[tokio::test]
    async fn test_unknown_decision_type_dropped() {
        let err = dispatcher()
            .dispatch(TOPIC, &decision("rocket_launch", true, "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::UnknownType { kind: "decision", .. }));
        assert_eq!(err.severity(), log::Level::Warn);
    }

    #[tokio::test]
    async fn test_version_mismatch_dropped() {
        let err = dispatcher()
            .dispatch(TOPIC, &decision("maintenance_decision", true, "1.1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InboundContract { .. }));
    }

    #[tokio::test]
    async fn test_missing_machine_id_dropped() {
        let err = dispatcher()
            .dispatch(TOPIC, br#"{"decision_type": "maintenance_decision", "payload": {}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingIdentity { .. }));
    }

    struct Jammed;

    #[async_trait]
    impl ActionExecutor for Jammed {
        async fn execute(&self, _: DecisionKind, _: &DecisionPayload) -> ActionOutcome {
            ActionOutcome {
                status: ActionStatus::Failure,
                details: "work order system unreachable".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_executor_failure_reported_in_confirmation() {
        let (_, confirmation) = dispatcher_with(Arc::new(Jammed))
            .dispatch(TOPIC, &decision("maintenance_decision", true, "1.0.0"))
            .await
            .unwrap();
        assert_eq!(confirmation["payload"]["status"], "failure");
        assert_eq!(confirmation["payload"]["action_taken"], "initiated");
        assert_eq!(
            confirmation["payload"]["details"],
            "work order system unreachable"
        );
    }
}
