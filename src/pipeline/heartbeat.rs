//! Retained capability announcements

use crate::bus::{MessageBus, Topics};
use crate::contracts::{ContractError, ContractRegistry};
use crate::messages::{AgentStatus, HeartbeatMessage, Timestamp};

use super::stage::Stage;

pub fn build(stage: &dyn Stage, status: AgentStatus, now: Timestamp) -> HeartbeatMessage {
    HeartbeatMessage {
        agent_id: stage.agent_id().to_string(),
        timestamp: now,
        capabilities: stage.capabilities(),
        status,
    }
}

/// Validate and publish a stage's heartbeat as a retained message
///
/// Failures are logged, never returned: a missed heartbeat must not stop
/// the worker.
pub async fn announce(
    stage: &dyn Stage,
    bus: &dyn MessageBus,
    registry: &ContractRegistry,
    topics: &Topics,
    status: AgentStatus,
    now: Timestamp,
) {
    let heartbeat = build(stage, status, now);
    let value = match registry.validate_outbound(&heartbeat) {
        Ok(value) => value,
        Err(e) => {
            log_invalid(stage.agent_id(), &e);
            return;
        }
    };

    if let Err(e) = bus
        .publish(topics.heartbeat(), value.to_string().into_bytes(), true)
        .await
    {
        log::warn!("[{}] heartbeat not published: {}", stage.agent_id(), e);
    }
}

fn log_invalid(agent_id: &str, e: &ContractError) {
    log::error!("[{}] generated heartbeat failed validation (internal error): {}", agent_id, e);
}
