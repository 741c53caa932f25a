//! Pipeline configuration from environment variables
//!
//! Every knob has a default matching the reference deployment, so an empty
//! environment yields a working pipeline. A value that is present but does not
//! parse is a startup error.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Longest window, retention or idle period accepted (one year)
pub const MAX_DURATION_SECS: i64 = 366 * 24 * 60 * 60;

pub const DEFAULT_FEATURES: [&str; 3] = [
    "avg_temperature_c_5min",
    "max_vibration_g_1min",
    "power_consumption_avg_10min",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Topic prefixes; each is followed by the machine id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub raw_prefix: String,
    pub context_prefix: String,
    pub decision_prefix: String,
    pub actions_prefix: String,
    pub heartbeat: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            raw_prefix: "raw_data/machine_sensors/".to_string(),
            context_prefix: "context/machine_status/".to_string(),
            decision_prefix: "decision/maintenance/".to_string(),
            actions_prefix: "simulated_actions/".to_string(),
            heartbeat: "agent/discovery/heartbeat".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIds {
    pub context: String,
    pub decision: String,
    pub action: String,
    pub monitor: String,
}

impl Default for AgentIds {
    fn default() -> Self {
        Self {
            context: "context_modeling_engine_001".to_string(),
            decision: "predictive_maintenance_agent_001".to_string(),
            action: "action_executor_001".to_string(),
            monitor: "performance_monitor_001".to_string(),
        }
    }
}

/// Configuration for the pipeline runtime
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory of `<contract>_v<version>.json` documents; embedded contracts
    /// when `None`. The file names set the version each stage accepts.
    pub schema_dir: Option<PathBuf>,

    pub topics: TopicConfig,
    pub agents: AgentIds,

    /// Readings kept per machine before the oldest is evicted
    pub buffer_capacity: usize,

    pub temperature_window_secs: i64,
    pub vibration_window_secs: i64,
    pub power_window_secs: i64,

    pub temperature_threshold: f64,
    pub vibration_threshold: f64,

    pub context_ttl_secs: u64,
    pub decision_ttl_secs: u64,
    pub confirmation_ttl_secs: u64,

    /// Ordered feature names handed to the predictor
    pub features: Vec<String>,
    /// JSON array of feature names; overrides `features` when set
    pub features_path: Option<PathBuf>,
    /// Decision-tree JSON export; threshold predictor when `None`
    pub model_path: Option<PathBuf>,

    /// Observability retention horizon
    pub retention_secs: i64,

    /// Reap machine buffers idle this long; 0 disables
    pub idle_entity_secs: i64,

    /// Worker housekeeping tick (heartbeat, sweep, throughput log)
    pub housekeeping_ms: u64,

    /// Parallel aggregation shards
    pub shards: usize,

    /// Per-shard channel and bus buffer size
    pub channel_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            schema_dir: None,
            topics: TopicConfig::default(),
            agents: AgentIds::default(),
            buffer_capacity: 300,
            temperature_window_secs: 5 * 60,
            vibration_window_secs: 60,
            power_window_secs: 10 * 60,
            temperature_threshold: 70.0,
            vibration_threshold: 3.0,
            context_ttl_secs: 60,
            decision_ttl_secs: 30,
            confirmation_ttl_secs: 30,
            features: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
            features_path: None,
            model_path: None,
            retention_secs: 5 * 60,
            idle_entity_secs: 0,
            housekeeping_ms: 10_000,
            shards: 4,
            channel_buffer: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `SENSORFLOW_SCHEMA_DIR` (default: embedded v1.0.0 contracts)
    /// - `SENSORFLOW_TOPIC_RAW`, `SENSORFLOW_TOPIC_CONTEXT`, `SENSORFLOW_TOPIC_DECISION`,
    ///   `SENSORFLOW_TOPIC_ACTIONS`, `SENSORFLOW_TOPIC_HEARTBEAT`
    /// - `SENSORFLOW_BUFFER_CAPACITY` (default: 300)
    /// - `SENSORFLOW_TEMP_WINDOW_SECS` (300), `SENSORFLOW_VIB_WINDOW_SECS` (60),
    ///   `SENSORFLOW_POWER_WINDOW_SECS` (600)
    /// - `SENSORFLOW_TEMP_THRESHOLD` (70.0), `SENSORFLOW_VIB_THRESHOLD` (3.0)
    /// - `SENSORFLOW_CONTEXT_TTL_SECS` (60), `SENSORFLOW_DECISION_TTL_SECS` (30),
    ///   `SENSORFLOW_CONFIRMATION_TTL_SECS` (30)
    /// - `SENSORFLOW_FEATURES` (comma separated), `SENSORFLOW_FEATURES_PATH`,
    ///   `SENSORFLOW_MODEL_PATH`
    /// - `SENSORFLOW_RETENTION_SECS` (300), `SENSORFLOW_IDLE_ENTITY_SECS` (0 = off)
    /// - `SENSORFLOW_HOUSEKEEPING_MS` (10000), `SENSORFLOW_SHARDS` (4),
    ///   `SENSORFLOW_CHANNEL_BUFFER` (10000)
    /// - `SENSORFLOW_AGENT_CONTEXT`, `SENSORFLOW_AGENT_DECISION`, `SENSORFLOW_AGENT_ACTION`,
    ///   `SENSORFLOW_AGENT_MONITOR`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);
        let path = |key: &str| {
            lookup(key)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
        };

        let features = match lookup("SENSORFLOW_FEATURES") {
            Some(list) => list
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            None => defaults.features.clone(),
        };

        let config = Self {
            schema_dir: path("SENSORFLOW_SCHEMA_DIR"),
            topics: TopicConfig {
                raw_prefix: string("SENSORFLOW_TOPIC_RAW", defaults.topics.raw_prefix),
                context_prefix: string(
                    "SENSORFLOW_TOPIC_CONTEXT",
                    defaults.topics.context_prefix,
                ),
                decision_prefix: string(
                    "SENSORFLOW_TOPIC_DECISION",
                    defaults.topics.decision_prefix,
                ),
                actions_prefix: string(
                    "SENSORFLOW_TOPIC_ACTIONS",
                    defaults.topics.actions_prefix,
                ),
                heartbeat: string("SENSORFLOW_TOPIC_HEARTBEAT", defaults.topics.heartbeat),
            },
            agents: AgentIds {
                context: string("SENSORFLOW_AGENT_CONTEXT", defaults.agents.context),
                decision: string("SENSORFLOW_AGENT_DECISION", defaults.agents.decision),
                action: string("SENSORFLOW_AGENT_ACTION", defaults.agents.action),
                monitor: string("SENSORFLOW_AGENT_MONITOR", defaults.agents.monitor),
            },
            buffer_capacity: parse(
                &lookup,
                "SENSORFLOW_BUFFER_CAPACITY",
                defaults.buffer_capacity,
            )?,
            temperature_window_secs: parse(
                &lookup,
                "SENSORFLOW_TEMP_WINDOW_SECS",
                defaults.temperature_window_secs,
            )?,
            vibration_window_secs: parse(
                &lookup,
                "SENSORFLOW_VIB_WINDOW_SECS",
                defaults.vibration_window_secs,
            )?,
            power_window_secs: parse(
                &lookup,
                "SENSORFLOW_POWER_WINDOW_SECS",
                defaults.power_window_secs,
            )?,
            temperature_threshold: parse(
                &lookup,
                "SENSORFLOW_TEMP_THRESHOLD",
                defaults.temperature_threshold,
            )?,
            vibration_threshold: parse(
                &lookup,
                "SENSORFLOW_VIB_THRESHOLD",
                defaults.vibration_threshold,
            )?,
            context_ttl_secs: parse(
                &lookup,
                "SENSORFLOW_CONTEXT_TTL_SECS",
                defaults.context_ttl_secs,
            )?,
            decision_ttl_secs: parse(
                &lookup,
                "SENSORFLOW_DECISION_TTL_SECS",
                defaults.decision_ttl_secs,
            )?,
            confirmation_ttl_secs: parse(
                &lookup,
                "SENSORFLOW_CONFIRMATION_TTL_SECS",
                defaults.confirmation_ttl_secs,
            )?,
            features,
            features_path: path("SENSORFLOW_FEATURES_PATH"),
            model_path: path("SENSORFLOW_MODEL_PATH"),
            retention_secs: parse(&lookup, "SENSORFLOW_RETENTION_SECS", defaults.retention_secs)?,
            idle_entity_secs: parse(
                &lookup,
                "SENSORFLOW_IDLE_ENTITY_SECS",
                defaults.idle_entity_secs,
            )?,
            housekeeping_ms: parse(
                &lookup,
                "SENSORFLOW_HOUSEKEEPING_MS",
                defaults.housekeeping_ms,
            )?,
            shards: parse(&lookup, "SENSORFLOW_SHARDS", defaults.shards)?,
            channel_buffer: parse(&lookup, "SENSORFLOW_CHANNEL_BUFFER", defaults.channel_buffer)?,
        };

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let durations = [
            ("SENSORFLOW_TEMP_WINDOW_SECS", self.temperature_window_secs, 1),
            ("SENSORFLOW_VIB_WINDOW_SECS", self.vibration_window_secs, 1),
            ("SENSORFLOW_POWER_WINDOW_SECS", self.power_window_secs, 1),
            ("SENSORFLOW_RETENTION_SECS", self.retention_secs, 1),
            ("SENSORFLOW_IDLE_ENTITY_SECS", self.idle_entity_secs, 0),
        ];
        for (key, value, min) in durations {
            if !(min..=MAX_DURATION_SECS).contains(&value) {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                    reason: format!("must be between {min} and {MAX_DURATION_SECS} seconds"),
                });
            }
        }

        if self.shards == 0 {
            return Err(ConfigError::Invalid {
                key: "SENSORFLOW_SHARDS",
                value: "0".to_string(),
                reason: "need at least one shard".to_string(),
            });
        }

        if self.features.is_empty() && self.features_path.is_none() {
            return Err(ConfigError::Invalid {
                key: "SENSORFLOW_FEATURES",
                value: String::new(),
                reason: "feature list is empty".to_string(),
            });
        }

        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[])).unwrap();

        assert!(config.schema_dir.is_none());
        assert_eq!(config.buffer_capacity, 300);
        assert_eq!(config.temperature_window_secs, 300);
        assert_eq!(config.vibration_window_secs, 60);
        assert_eq!(config.power_window_secs, 600);
        assert_eq!(config.temperature_threshold, 70.0);
        assert_eq!(config.vibration_threshold, 3.0);
        assert_eq!(config.context_ttl_secs, 60);
        assert_eq!(config.features.len(), 3);
        assert_eq!(config.topics.raw_prefix, "raw_data/machine_sensors/");
        assert_eq!(config.agents.context, "context_modeling_engine_001");
        assert_eq!(config.idle_entity_secs, 0);
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("SENSORFLOW_SCHEMA_DIR", "/etc/sensorflow/schemas"),
            ("SENSORFLOW_TEMP_THRESHOLD", "65.5"),
            ("SENSORFLOW_BUFFER_CAPACITY", " 500 "),
            ("SENSORFLOW_FEATURES", "a, b ,,c"),
            ("SENSORFLOW_TOPIC_RAW", "plant1/raw/"),
        ]))
        .unwrap();

        assert_eq!(config.schema_dir, Some(PathBuf::from("/etc/sensorflow/schemas")));
        assert_eq!(config.temperature_threshold, 65.5);
        assert_eq!(config.buffer_capacity, 500);
        assert_eq!(config.features, vec!["a", "b", "c"]);
        assert_eq!(config.topics.raw_prefix, "plant1/raw/");
    }

    #[test]
    fn test_invalid_number_is_error() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("SENSORFLOW_SHARDS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SENSORFLOW_SHARDS"));
    }

    #[test]
    fn test_non_positive_window_rejected() {
        let config = |pairs: &[(&str, &str)]| PipelineConfig::from_lookup(lookup_from(pairs));
        assert!(config(&[("SENSORFLOW_VIB_WINDOW_SECS", "0")]).is_err());
        assert!(config(&[("SENSORFLOW_SHARDS", "0")]).is_err());
        assert!(config(&[("SENSORFLOW_IDLE_ENTITY_SECS", "-5")]).is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let huge = i64::MAX.to_string();
        for key in [
            "SENSORFLOW_TEMP_WINDOW_SECS",
            "SENSORFLOW_VIB_WINDOW_SECS",
            "SENSORFLOW_POWER_WINDOW_SECS",
            "SENSORFLOW_RETENTION_SECS",
            "SENSORFLOW_IDLE_ENTITY_SECS",
        ] {
            let err =
                PipelineConfig::from_lookup(lookup_from(&[(key, huge.as_str())])).unwrap_err();
            assert!(err.to_string().contains(key));
        }

        let year = MAX_DURATION_SECS.to_string();
        let config =
            PipelineConfig::from_lookup(lookup_from(&[("SENSORFLOW_POWER_WINDOW_SECS", &year)]))
                .unwrap();
        assert_eq!(config.power_window_secs, MAX_DURATION_SECS);
    }
}
