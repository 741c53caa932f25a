//! Decision Router: context in, maintenance decision out

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use super::predictor::{FeatureSet, Predictor};
use crate::bus::Topics;
use crate::contracts::{ContractRegistry, MAINTENANCE_DECISION, PROCESSED_MACHINE_CONTEXT};
use crate::error::StageError;
use crate::messages::{
    new_id, CapabilityRef, Capabilities, ContextMessage, DecisionMessage, DecisionPayload,
    Metadata, Priority, Timestamp, CONTEXT_TYPE, MAINTENANCE_DECISION_TYPE,
};
use crate::pipeline::{Outbound, Stage};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub agent_id: String,
    pub ttl_secs: u64,
}

pub struct DecisionRouter {
    registry: Arc<ContractRegistry>,
    topics: Topics,
    features: FeatureSet,
    predictor: Arc<dyn Predictor>,
    settings: RouterSettings,
    now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl DecisionRouter {
    pub fn new(
        registry: Arc<ContractRegistry>,
        topics: Topics,
        features: FeatureSet,
        predictor: Arc<dyn Predictor>,
        settings: RouterSettings,
    ) -> Self {
        Self::new_with_timestamp_fn(
            registry,
            topics,
            features,
            predictor,
            settings,
            Box::new(Utc::now),
        )
    }

    /// Constructor with an injectable clock (for testing)
    pub fn new_with_timestamp_fn(
        registry: Arc<ContractRegistry>,
        topics: Topics,
        features: FeatureSet,
        predictor: Arc<dyn Predictor>,
        settings: RouterSettings,
        now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Self {
        log::info!(
            "[{}] using {} predictor over {:?}",
            settings.agent_id,
            predictor.name(),
            features.names()
        );
        Self {
            registry,
            topics,
            features,
            predictor,
            settings,
            now_fn,
        }
    }

    /// Turn one serialized context into a validated decision
    ///
    /// # Arguments
    /// * `topic` - Topic the context arrived on (used in error reports)
    /// * `payload` - Context message as JSON bytes
    ///
    /// # Returns
    /// The decision topic for the machine and the validated decision, or the
    /// reason the context was dropped
    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<(String, Value), StageError> {
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
            contract: PROCESSED_MACHINE_CONTEXT,
            entity: entity.clone(),
            source,
        };
        self.registry
            .validate(&value, PROCESSED_MACHINE_CONTEXT)
            .map_err(inbound)?;
        self.registry
            .check_supported_version(&value, PROCESSED_MACHINE_CONTEXT)
            .map_err(inbound)?;

        let context_type = value
            .get("context_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if context_type != CONTEXT_TYPE {
            return Err(StageError::UnknownType {
                kind: "context",
                found: context_type.to_string(),
                entity,
            });
        }

        let context: ContextMessage =
            serde_json::from_value(value.clone()).map_err(|e| StageError::Malformed {
                topic: topic.to_string(),
                detail: e.to_string(),
            })?;

        // Features come from the raw payload so any numeric field can be named
        let predictor_error = |source| StageError::Predictor {
            entity: entity.clone(),
            source,
        };
        let features = self
            .features
            .extract(&value["payload"])
            .map_err(predictor_error)?;
        let prediction = self.predictor.infer(&features).map_err(predictor_error)?;

        let decision = DecisionMessage {
            decision_id: new_id(),
            timestamp: (self.now_fn)(),
            source_agent_id: self.settings.agent_id.clone(),
            decision_type: MAINTENANCE_DECISION_TYPE.to_string(),
            schema_version: self.registry.version_of(MAINTENANCE_DECISION),
            payload: DecisionPayload {
                entity_id: entity.clone(),
                needs_action: prediction.label,
                confidence: prediction.confidence.clamp(0.0, 1.0),
                feature_snapshot: features.to_map(),
                context_id: Some(context.context_id),
            },
            metadata: Metadata {
                priority: Priority::from_flag(prediction.label),
                ttl_seconds: self.settings.ttl_secs,
            },
        };

        let out = self
            .registry
            .validate_outbound(&decision)
            .map_err(|source| StageError::OutboundContract {
                contract: MAINTENANCE_DECISION,
                entity: entity.clone(),
                source,
            })?;

        if prediction.label {
            log::info!(
                "[{}] maintenance needed for {} (confidence {:.2})",
                self.settings.agent_id,
                entity,
                prediction.confidence
            );
        } else {
            log::debug!(
                "[{}] no maintenance for {} (confidence {:.2})",
                self.settings.agent_id,
                entity,
                prediction.confidence
            );
        }

        Ok((self.topics.decision(&entity), out))
    }
}

#[async_trait]
impl Stage for DecisionRouter {
    fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![self.topics.context_filter()]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            consumes: vec![CapabilityRef::new(
                CONTEXT_TYPE,
                self.registry.version_of(PROCESSED_MACHINE_CONTEXT),
            )],
            produces: vec![CapabilityRef::new(
                MAINTENANCE_DECISION_TYPE,
                self.registry.version_of(MAINTENANCE_DECISION),
            )],
        }
    }

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<Outbound>, StageError> {
        let (out_topic, decision) = self.route(topic, payload)?;
        Ok(vec![Outbound::json(out_topic, &decision)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::router::predictor::{FeatureVector, Prediction, PredictorError, ThresholdPredictor};
    use chrono::TimeZone;
    use serde_json::json;

    fn router_with(predictor: Arc<dyn Predictor>) -> DecisionRouter {
        DecisionRouter::new_with_timestamp_fn(
            Arc::new(ContractRegistry::builtin().unwrap()),
            Topics::new(TopicConfig::default()),
            FeatureSet::new([
                "avg_temperature_c_5min",
                "max_vibration_g_1min",
                "power_consumption_avg_10min",
            ])
            .unwrap(),
            predictor,
            RouterSettings {
                agent_id: "predictive_maintenance_agent_001".to_string(),
                ttl_secs: 30,
            },
            Box::new(|| Utc.timestamp_opt(1_714_564_800, 0).unwrap()),
        )
    }

    fn router() -> DecisionRouter {
        router_with(Arc::new(ThresholdPredictor::with_defaults()))
    }

    fn context(avg_temp: f64, version: &str, context_type: &str) -> Vec<u8> {
        json!({
            "context_id": "ctx-42",
            "timestamp": "2024-05-01T12:00:00Z",
            "source_agent_id": "context_modeling_engine_001",
            "context_type": context_type,
            "schema_version": version,
            "payload": {
                "machine_id": "CNC001",
                "current_status": "running",
                "avg_temperature_c_5min": avg_temp,
                "max_vibration_g_1min": 1.2,
                "power_consumption_avg_10min": 25.0,
                "is_anomaly_detected": avg_temp > 70.0
            },
            "metadata": {"priority": "normal", "ttl_seconds": 60}
        })
        .to_string()
        .into_bytes()
    }

    const TOPIC: &str = "context/machine_status/CNC001";

    #[test]
    fn test_hot_context_needs_maintenance() {
        let (topic, decision) = router()
            .route(TOPIC, &context(77.67, "1.0.0", CONTEXT_TYPE))
            .unwrap();

        assert_eq!(topic, "decision/maintenance/CNC001");
        assert_eq!(decision["decision_type"], "maintenance_decision");
        assert_eq!(decision["payload"]["needs_maintenance"], true);
        assert_eq!(decision["payload"]["context_id"], "ctx-42");
        assert_eq!(decision["metadata"]["priority"], "high");
        assert_eq!(decision["metadata"]["ttl_seconds"], 30);
        assert_eq!(
            decision["payload"]["predicted_features"]["avg_temperature_c_5min"],
            77.67
        );

        let confidence = decision["payload"]["prediction_confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }

    #[test]
    fn test_calm_context_normal_priority() {
        let (_, decision) = router()
            .route(TOPIC, &context(40.0, "1.0.0", CONTEXT_TYPE))
            .unwrap();
        assert_eq!(decision["payload"]["needs_maintenance"], false);
        assert_eq!(decision["metadata"]["priority"], "normal");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let err = router()
            .route(TOPIC, &context(77.0, "2.0.0", CONTEXT_TYPE))
            .unwrap_err();
        match err {
            StageError::InboundContract { source, .. } => assert!(source.is_version_mismatch()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_context_type() {
        let err = router()
            .route(TOPIC, &context(77.0, "1.0.0", "line_status_context"))
            .unwrap_err();
        assert!(matches!(err, StageError::UnknownType { kind: "context", .. }));
    }

    #[test]
    fn test_malformed_and_missing_identity() {
        assert!(matches!(
            router().route(TOPIC, b"{not json"),
            Err(StageError::Malformed { .. })
        ));
        assert!(matches!(
            router().route(TOPIC, br#"{"payload": {}}"#),
            Err(StageError::MissingIdentity { .. })
        ));
    }

    #[test]
    fn test_schema_violation_is_inbound_error() {
        let mut value: Value =
            serde_json::from_slice(&context(50.0, "1.0.0", CONTEXT_TYPE)).unwrap();
        value["payload"]
            .as_object_mut()
            .unwrap()
            .remove("power_consumption_avg_10min");

        let err = router()
            .route(TOPIC, value.to_string().as_bytes())
            .unwrap_err();
        assert!(matches!(err, StageError::InboundContract { .. }));
    }

    struct Overconfident;

    impl Predictor for Overconfident {
        fn infer(&self, _: &FeatureVector) -> Result<Prediction, PredictorError> {
            Ok(Prediction {
                label: true,
                confidence: 1.7,
            })
        }

        fn name(&self) -> &'static str {
            "overconfident"
        }
    }

    #[test]
    fn test_confidence_clamped_into_contract_range() {
        let (_, decision) = router_with(Arc::new(Overconfident))
            .route(TOPIC, &context(50.0, "1.0.0", CONTEXT_TYPE))
            .unwrap();
        assert_eq!(decision["payload"]["prediction_confidence"], 1.0);
    }

    struct Broken;

    impl Predictor for Broken {
        fn infer(&self, _: &FeatureVector) -> Result<Prediction, PredictorError> {
            Err(PredictorError::Invalid("weights corrupted".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_predictor_failure_drops_message() {
        let err = router_with(Arc::new(Broken))
            .route(TOPIC, &context(50.0, "1.0.0", CONTEXT_TYPE))
            .unwrap_err();
        assert!(matches!(err, StageError::Predictor { .. }));
        assert_eq!(err.severity(), log::Level::Error);
    }
}
