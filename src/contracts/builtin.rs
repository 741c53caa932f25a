//! Contract documents compiled into the binary

use super::{
    ACTION_CONFIRMATION, AGENT_HEARTBEAT, MAINTENANCE_DECISION, PROCESSED_MACHINE_CONTEXT,
    RAW_MACHINE_DATA,
};

pub const BUILTIN_VERSION: &str = "1.0.0";

/// (contract name, version, schema document)
pub const DOCUMENTS: [(&str, &str, &str); 5] = [
    (
        RAW_MACHINE_DATA,
        BUILTIN_VERSION,
        include_str!("../../schemas/raw_machine_data_v1.0.0.json"),
    ),
    (
        PROCESSED_MACHINE_CONTEXT,
        BUILTIN_VERSION,
        include_str!("../../schemas/processed_machine_context_v1.0.0.json"),
    ),
    (
        MAINTENANCE_DECISION,
        BUILTIN_VERSION,
        include_str!("../../schemas/maintenance_decision_v1.0.0.json"),
    ),
    (
        ACTION_CONFIRMATION,
        BUILTIN_VERSION,
        include_str!("../../schemas/action_confirmation_v1.0.0.json"),
    ),
    (
        AGENT_HEARTBEAT,
        BUILTIN_VERSION,
        include_str!("../../schemas/agent_heartbeat_v1.0.0.json"),
    ),
];
