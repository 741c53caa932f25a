//! Context Aggregator: one raw reading in, one machine context out

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::detector::AnomalyDetector;
use crate::bus::Topics;
use crate::config::PipelineConfig;
use crate::contracts::{ContractRegistry, PROCESSED_MACHINE_CONTEXT, RAW_MACHINE_DATA};
use crate::error::StageError;
use crate::messages::{
    new_id, CapabilityRef, Capabilities, ContextMessage, ContextPayload, Metadata, Priority,
    Reading, Timestamp, CONTEXT_TYPE,
};
use crate::pipeline::{Outbound, Stage};
use crate::window::{ReadingField, Reducer, WindowStore};

/// Raw readings are announced under their contract name
const RAW_READING_TYPE: &str = RAW_MACHINE_DATA;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub agent_id: String,
    pub temperature_window: Duration,
    pub vibration_window: Duration,
    pub power_window: Duration,
    pub ttl_secs: u64,
    /// `None` keeps idle machines forever
    pub idle_entity: Option<Duration>,
}

impl AggregatorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            agent_id: config.agents.context.clone(),
            temperature_window: Duration::seconds(config.temperature_window_secs),
            vibration_window: Duration::seconds(config.vibration_window_secs),
            power_window: Duration::seconds(config.power_window_secs),
            ttl_secs: config.context_ttl_secs,
            idle_entity: (config.idle_entity_secs > 0)
                .then(|| Duration::seconds(config.idle_entity_secs)),
        }
    }
}

/// Windowed aggregates for one machine, after the triggering reading was
/// appended. Values are unrounded; rounding is applied only on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub avg_temperature: f64,
    pub max_vibration: f64,
    pub avg_power: f64,
}

pub struct ContextAggregator {
    registry: Arc<ContractRegistry>,
    topics: Topics,
    store: WindowStore,
    detector: AnomalyDetector,
    settings: AggregatorSettings,
    now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl ContextAggregator {
    pub fn new(
        registry: Arc<ContractRegistry>,
        topics: Topics,
        store: WindowStore,
        detector: AnomalyDetector,
        settings: AggregatorSettings,
    ) -> Self {
        Self::new_with_timestamp_fn(registry, topics, store, detector, settings, Box::new(Utc::now))
    }

    /// Constructor with an injectable clock (for testing)
    pub fn new_with_timestamp_fn(
        registry: Arc<ContractRegistry>,
        topics: Topics,
        store: WindowStore,
        detector: AnomalyDetector,
        settings: AggregatorSettings,
        now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            topics,
            store,
            detector,
            settings,
            now_fn,
        }
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    /// Validate, buffer and aggregate one serialized reading
    ///
    /// # Arguments
    /// * `topic` - Topic the reading arrived on (used in error reports)
    /// * `payload` - Raw reading as JSON bytes
    ///
    /// # Returns
    /// The context topic for the machine and the validated context message,
    /// or the reason the reading was dropped. A dropped reading never touches
    /// the window store.
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Result<(String, Value), StageError> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| StageError::Malformed {
            topic: topic.to_string(),
            detail: e.to_string(),
        })?;

        let entity = value
            .get("machine_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StageError::MissingIdentity {
                topic: topic.to_string(),
            })?
            .to_string();

        let inbound = |source| StageError::InboundContract {
            contract: RAW_MACHINE_DATA,
            entity: entity.clone(),
            source,
        };
        self.registry
            .validate(&value, RAW_MACHINE_DATA)
            .map_err(inbound)?;
        // Sensors may omit the version; a present one must match exactly
        if value.get("schema_version").is_some() {
            self.registry
                .check_supported_version(&value, RAW_MACHINE_DATA)
                .map_err(inbound)?;
        }

        let reading: Reading =
            serde_json::from_value(value).map_err(|e| StageError::Malformed {
                topic: topic.to_string(),
                detail: e.to_string(),
            })?;

        let context = self.build_context(reading);

        let out = self
            .registry
            .validate_outbound(&context)
            .map_err(|source| StageError::OutboundContract {
                contract: PROCESSED_MACHINE_CONTEXT,
                entity: entity.clone(),
                source,
            })?;

        Ok((self.topics.context(&entity), out))
    }

    /// Append the reading and compute its context
    pub fn build_context(&self, reading: Reading) -> ContextMessage {
        let now = (self.now_fn)();
        let entity = reading.entity_id.clone();
        let current_status = reading.status;

        let summary = self.process_reading(reading, now);
        let is_anomaly = self
            .detector
            .is_anomaly(summary.avg_temperature, summary.max_vibration);

        if is_anomaly {
            log::info!(
                "[{}] anomaly on {}: avg temp {:.2}, max vibration {:.2}",
                self.settings.agent_id,
                entity,
                summary.avg_temperature,
                summary.max_vibration
            );
        }

        ContextMessage {
            context_id: new_id(),
            timestamp: now,
            source_agent_id: self.settings.agent_id.clone(),
            context_type: CONTEXT_TYPE.to_string(),
            schema_version: self.registry.version_of(PROCESSED_MACHINE_CONTEXT),
            payload: ContextPayload {
                entity_id: entity,
                current_status,
                avg_temperature: round2(summary.avg_temperature),
                max_vibration: round2(summary.max_vibration),
                avg_power: round2(summary.avg_power),
                is_anomaly,
            },
            metadata: Metadata {
                priority: Priority::from_flag(is_anomaly),
                ttl_seconds: self.settings.ttl_secs,
            },
        }
    }

    /// Append and aggregate under the entity's lock so a concurrent reading
    /// for the same machine cannot land between the two
    fn process_reading(&self, reading: Reading, now: Timestamp) -> WindowSummary {
        let entity = reading.entity_id.clone();
        let settings = &self.settings;

        self.store.update(&entity, reading, |buffer| WindowSummary {
            avg_temperature: buffer.aggregate(
                now - settings.temperature_window,
                ReadingField::Temperature,
                Reducer::Avg,
            ),
            max_vibration: buffer.aggregate(
                now - settings.vibration_window,
                ReadingField::Vibration,
                Reducer::Max,
            ),
            avg_power: buffer.aggregate(
                now - settings.power_window,
                ReadingField::Power,
                Reducer::Avg,
            ),
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl Stage for ContextAggregator {
    fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![self.topics.raw_filter()]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            consumes: vec![CapabilityRef::new(
                RAW_READING_TYPE,
                self.registry.version_of(RAW_MACHINE_DATA),
            )],
            produces: vec![CapabilityRef::new(
                CONTEXT_TYPE,
                self.registry.version_of(PROCESSED_MACHINE_CONTEXT),
            )],
        }
    }

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<Outbound>, StageError> {
        let (out_topic, context) = self.ingest(topic, payload)?;
        Ok(vec![Outbound::json(out_topic, &context)])
    }

    fn housekeeping(&self, now: Timestamp) {
        if let Some(idle_for) = self.settings.idle_entity {
            let reaped = self.store.reap_idle(idle_for, now);
            if reaped > 0 {
                log::info!(
                    "[{}] reaped {} idle machine buffers ({} active)",
                    self.settings.agent_id,
                    reaped,
                    self.store.entity_count()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::messages::MachineStatus;
    use chrono::TimeZone;
    use serde_json::json;

    fn base() -> Timestamp {
        Utc.timestamp_opt(1_714_564_800, 0).unwrap()
    }

    fn aggregator_at(now: Timestamp) -> ContextAggregator {
        let config = PipelineConfig::default();
        ContextAggregator::new_with_timestamp_fn(
            Arc::new(ContractRegistry::builtin().unwrap()),
            Topics::new(TopicConfig::default()),
            WindowStore::new(config.buffer_capacity),
            AnomalyDetector::with_defaults(),
            AggregatorSettings::from_config(&config),
            Box::new(move || now),
        )
    }

    fn raw(entity: &str, offset_secs: i64, temp: f64, vib: f64, power: f64) -> Vec<u8> {
        let ts = base() + Duration::seconds(offset_secs);
        json!({
            "machine_id": entity,
            "timestamp": ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            "temperature_c": temp,
            "vibration_g": vib,
            "power_kw": power,
            "status": "running"
        })
        .to_string()
        .into_bytes()
    }

    const TOPIC: &str = "raw_data/machine_sensors/CNC001";

    #[test]
    fn test_single_normal_reading() {
        let aggregator = aggregator_at(base() + Duration::seconds(1));
        let (topic, context) = aggregator
            .ingest(TOPIC, &raw("CNC001", 0, 35.5, 0.8, 12.3))
            .unwrap();

        assert_eq!(topic, "context/machine_status/CNC001");
        assert_eq!(context["context_type"], "machine_status_context");
        assert_eq!(context["payload"]["machine_id"], "CNC001");
        assert_eq!(context["payload"]["current_status"], "running");
        assert_eq!(context["payload"]["is_anomaly_detected"], false);
        assert_eq!(context["payload"]["avg_temperature_c_5min"], 35.5);
        assert_eq!(context["payload"]["max_vibration_g_1min"], 0.8);
        assert_eq!(context["payload"]["power_consumption_avg_10min"], 12.3);
        assert_eq!(context["metadata"]["priority"], "normal");
        assert_eq!(context["metadata"]["ttl_seconds"], 60);
    }

    #[test]
    fn test_sustained_heat_is_anomalous() {
        let aggregator = aggregator_at(base() + Duration::seconds(30));
        aggregator.ingest(TOPIC, &raw("CNC001", 0, 75.0, 1.0, 20.0)).unwrap();
        aggregator.ingest(TOPIC, &raw("CNC001", 10, 80.0, 1.0, 20.0)).unwrap();
        let (_, context) = aggregator
            .ingest(TOPIC, &raw("CNC001", 20, 78.0, 1.0, 20.0))
            .unwrap();

        assert_eq!(context["payload"]["avg_temperature_c_5min"], 77.67);
        assert_eq!(context["payload"]["is_anomaly_detected"], true);
        assert_eq!(context["metadata"]["priority"], "high");
    }

    #[test]
    fn test_vibration_spike_outside_short_window_ignored() {
        let aggregator = aggregator_at(base() + Duration::seconds(120));
        aggregator.ingest(TOPIC, &raw("CNC001", 0, 30.0, 3.5, 20.0)).unwrap();
        let (_, context) = aggregator
            .ingest(TOPIC, &raw("CNC001", 100, 30.0, 0.5, 20.0))
            .unwrap();

        assert_eq!(context["payload"]["max_vibration_g_1min"], 0.5);
        assert_eq!(context["payload"]["is_anomaly_detected"], false);
    }

    #[test]
    fn test_status_comes_from_triggering_reading() {
        let aggregator = aggregator_at(base() + Duration::seconds(5));
        let reading = Reading {
            entity_id: "CNC002".to_string(),
            timestamp: base(),
            temperature: 30.0,
            vibration: 0.2,
            power: 5.0,
            status: MachineStatus::Maintenance,
            schema_version: None,
        };
        let context = aggregator.build_context(reading);
        assert_eq!(context.payload.current_status, MachineStatus::Maintenance);
        assert_eq!(context.timestamp, base() + Duration::seconds(5));
    }

    #[test]
    fn test_rejects_bad_input() {
        let aggregator = aggregator_at(base());

        assert!(matches!(
            aggregator.ingest(TOPIC, b"nope"),
            Err(StageError::Malformed { .. })
        ));

        let anonymous = br#"{"timestamp": "2024-05-01T12:00:00", "temperature_c": 1.0}"#;
        assert!(matches!(
            aggregator.ingest(TOPIC, anonymous),
            Err(StageError::MissingIdentity { .. })
        ));

        let mut bad_status: Value =
            serde_json::from_slice(&raw("CNC001", 0, 30.0, 0.1, 1.0)).unwrap();
        bad_status["status"] = json!("exploded");
        assert!(matches!(
            aggregator.ingest(TOPIC, bad_status.to_string().as_bytes()),
            Err(StageError::InboundContract { .. })
        ));

        // Rejected readings never reach the window store
        assert_eq!(aggregator.store().entity_count(), 0);
    }

    #[test]
    fn test_anomaly_decided_before_rounding() {
        let aggregator = aggregator_at(base() + Duration::seconds(1));
        let (_, context) = aggregator
            .ingest(TOPIC, &raw("CNC001", 0, 70.004, 0.5, 10.0))
            .unwrap();
        assert_eq!(context["payload"]["avg_temperature_c_5min"], 70.0);
        assert_eq!(context["payload"]["is_anomaly_detected"], true);
        assert_eq!(context["metadata"]["priority"], "high");

        let (_, context) = aggregator
            .ingest("raw_data/machine_sensors/CNC002", &raw("CNC002", 0, 40.0, 3.004, 10.0))
            .unwrap();
        assert_eq!(context["payload"]["max_vibration_g_1min"], 3.0);
        assert_eq!(context["payload"]["is_anomaly_detected"], true);

        // Exactly on the thresholds is still normal
        let (_, context) = aggregator
            .ingest("raw_data/machine_sensors/CNC003", &raw("CNC003", 0, 70.0, 3.0, 10.0))
            .unwrap();
        assert_eq!(context["payload"]["is_anomaly_detected"], false);
    }

    #[test]
    fn test_rejects_machine_id_that_breaks_topics() {
        let aggregator = aggregator_at(base() + Duration::seconds(1));
        for bad in ["line1/CNC", "CNC+", "CNC#9"] {
            let err = aggregator
                .ingest(TOPIC, &raw(bad, 0, 30.0, 0.1, 1.0))
                .unwrap_err();
            assert!(matches!(err, StageError::InboundContract { .. }), "{bad}");
        }
        assert_eq!(aggregator.store().entity_count(), 0);
    }

    #[test]
    fn test_raw_version_follows_registry() {
        let mut registry = ContractRegistry::builtin().unwrap();
        let (_, _, document) = crate::contracts::builtin::DOCUMENTS[0];
        registry
            .register_document(RAW_MACHINE_DATA, "1.1.0", document)
            .unwrap();
        let now = base() + Duration::seconds(1);
        let aggregator = ContextAggregator::new_with_timestamp_fn(
            Arc::new(registry),
            Topics::new(TopicConfig::default()),
            WindowStore::new(10),
            AnomalyDetector::with_defaults(),
            AggregatorSettings::from_config(&PipelineConfig::default()),
            Box::new(move || now),
        );

        let mut reading: Value =
            serde_json::from_slice(&raw("CNC001", 0, 30.0, 0.1, 1.0)).unwrap();
        reading["schema_version"] = json!("1.1.0");
        assert!(aggregator.ingest(TOPIC, reading.to_string().as_bytes()).is_ok());

        reading["schema_version"] = json!("1.0.0");
        assert!(aggregator.ingest(TOPIC, reading.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_raw_schema_version_checked_when_present() {
        let aggregator = aggregator_at(base() + Duration::seconds(1));
        let mut reading: Value =
            serde_json::from_slice(&raw("CNC001", 0, 30.0, 0.1, 1.0)).unwrap();

        reading["schema_version"] = json!("1.0.0");
        assert!(aggregator.ingest(TOPIC, reading.to_string().as_bytes()).is_ok());

        reading["schema_version"] = json!("0.9.0");
        let err = aggregator
            .ingest(TOPIC, reading.to_string().as_bytes())
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::InboundContract { ref source, .. } if source.is_version_mismatch()
        ));
    }

    #[test]
    fn test_idle_reaper_runs_on_housekeeping() {
        let config = PipelineConfig {
            idle_entity_secs: 60,
            ..PipelineConfig::default()
        };
        let aggregator = ContextAggregator::new_with_timestamp_fn(
            Arc::new(ContractRegistry::builtin().unwrap()),
            Topics::new(TopicConfig::default()),
            WindowStore::new(10),
            AnomalyDetector::with_defaults(),
            AggregatorSettings::from_config(&config),
            Box::new(base),
        );
        aggregator.ingest(TOPIC, &raw("CNC001", 0, 30.0, 0.1, 1.0)).unwrap();
        assert_eq!(aggregator.store().entity_count(), 1);

        aggregator.housekeeping(base() + Duration::seconds(30));
        assert_eq!(aggregator.store().entity_count(), 1);

        aggregator.housekeeping(base() + Duration::seconds(120));
        assert_eq!(aggregator.store().entity_count(), 0);
    }
}
