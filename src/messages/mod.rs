//! Typed message records for every topic on the pipeline bus
//!
//! Field names on the wire follow the JSON contracts under `schemas/`; the Rust
//! side uses the pipeline's own vocabulary (`entity_id`, `temperature`, ...).
//!
//! ```text
//! Reading ──► ContextMessage ──► DecisionMessage ──► ConfirmationMessage
//!                                                     HeartbeatMessage (retained)
//! ```

pub mod timestamp;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use timestamp::Timestamp;

pub const CONTEXT_TYPE: &str = "machine_status_context";
pub const MAINTENANCE_DECISION_TYPE: &str = "maintenance_decision";
pub const CONFIRMATION_TYPE: &str = "action_confirmation";

/// Contract name a message type is validated against
pub trait Contracted {
    const CONTRACT: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Running,
    Idle,
    Error,
    Maintenance,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Running => "running",
            MachineStatus::Idle => "idle",
            MachineStatus::Error => "error",
            MachineStatus::Maintenance => "maintenance",
        }
    }
}

/// One sensor sample from a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "machine_id")]
    pub entity_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: Timestamp,
    #[serde(rename = "temperature_c")]
    pub temperature: f64,
    #[serde(rename = "vibration_g")]
    pub vibration: f64,
    #[serde(rename = "power_kw")]
    pub power: f64,
    pub status: MachineStatus,
    /// Optional on raw readings; checked for equality only when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

impl Contracted for Reading {
    const CONTRACT: &'static str = crate::contracts::RAW_MACHINE_DATA;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn from_flag(high: bool) -> Self {
        if high {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// Advisory delivery hints; nothing in the pipeline enforces the TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub priority: Priority,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    #[serde(rename = "machine_id")]
    pub entity_id: String,
    pub current_status: MachineStatus,
    #[serde(rename = "avg_temperature_c_5min")]
    pub avg_temperature: f64,
    #[serde(rename = "max_vibration_g_1min")]
    pub max_vibration: f64,
    #[serde(rename = "power_consumption_avg_10min")]
    pub avg_power: f64,
    #[serde(rename = "is_anomaly_detected")]
    pub is_anomaly: bool,
}

/// Windowed snapshot of one machine, produced once per accepted reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub context_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: Timestamp,
    pub source_agent_id: String,
    pub context_type: String,
    pub schema_version: String,
    pub payload: ContextPayload,
    pub metadata: Metadata,
}

impl Contracted for ContextMessage {
    const CONTRACT: &'static str = crate::contracts::PROCESSED_MACHINE_CONTEXT;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPayload {
    #[serde(rename = "machine_id")]
    pub entity_id: String,
    #[serde(rename = "needs_maintenance")]
    pub needs_action: bool,
    #[serde(rename = "prediction_confidence")]
    pub confidence: f64,
    #[serde(rename = "predicted_features")]
    pub feature_snapshot: BTreeMap<String, f64>,
    /// Context that produced this decision. Absent from older producers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMessage {
    pub decision_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: Timestamp,
    pub source_agent_id: String,
    pub decision_type: String,
    pub schema_version: String,
    pub payload: DecisionPayload,
    pub metadata: Metadata,
}

impl Contracted for DecisionMessage {
    const CONTRACT: &'static str = crate::contracts::MAINTENANCE_DECISION;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Initiated,
    NoActionTaken,
}

impl ActionTaken {
    pub fn from_decision(needs_action: bool) -> Self {
        if needs_action {
            ActionTaken::Initiated
        } else {
            ActionTaken::NoActionTaken
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationPayload {
    #[serde(rename = "machine_id")]
    pub entity_id: String,
    pub decision_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub action_taken: ActionTaken,
    pub status: ActionStatus,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationMessage {
    pub confirmation_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: Timestamp,
    pub source_agent_id: String,
    pub confirmation_type: String,
    pub schema_version: String,
    pub payload: ConfirmationPayload,
    pub metadata: Metadata,
}

impl Contracted for ConfirmationMessage {
    const CONTRACT: &'static str = crate::contracts::ACTION_CONFIRMATION;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRef {
    #[serde(rename = "type")]
    pub message_type: String,
    pub schema_version: String,
}

impl CapabilityRef {
    pub fn new(message_type: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            schema_version: schema_version.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub consumes: Vec<CapabilityRef>,
    pub produces: Vec<CapabilityRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Degraded,
    Offline,
}

/// Retained capability announcement used for discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub agent_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: Timestamp,
    pub capabilities: Capabilities,
    pub status: AgentStatus,
}

impl Contracted for HeartbeatMessage {
    const CONTRACT: &'static str = crate::contracts::AGENT_HEARTBEAT;
}

/// Fresh message identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
