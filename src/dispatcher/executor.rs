//! Action executors behind the dispatcher

use async_trait::async_trait;

use crate::messages::{ActionStatus, DecisionPayload};

/// Decision families the dispatcher knows how to act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    Maintenance,
}

impl DecisionKind {
    pub fn parse(decision_type: &str) -> Option<Self> {
        match decision_type {
            "maintenance_decision" => Some(DecisionKind::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Maintenance => "maintenance_decision",
        }
    }
}

/// Result of carrying out one decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub details: String,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, kind: DecisionKind, decision: &DecisionPayload) -> ActionOutcome;
}

/// Logs the action instead of performing it; never fails
#[derive(Debug, Default)]
pub struct SimulatedExecutor;

#[async_trait]
impl ActionExecutor for SimulatedExecutor {
    async fn execute(&self, kind: DecisionKind, decision: &DecisionPayload) -> ActionOutcome {
        let details = match (kind, decision.needs_action) {
            (DecisionKind::Maintenance, true) => {
                log::warn!(
                    "SIMULATING ACTION: scheduling maintenance for {} (confidence {:.2})",
                    decision.entity_id,
                    decision.confidence
                );
                "Simulated maintenance initiation"
            }
            (DecisionKind::Maintenance, false) => {
                log::debug!("No action required for {}", decision.entity_id);
                "No maintenance required"
            }
        };

        ActionOutcome {
            status: ActionStatus::Success,
            details: details.to_string(),
        }
    }
}
