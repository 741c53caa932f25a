//! Per-message drop reasons shared by every stage
//!
//! None of these ever stop a worker. A stage returns one, the worker logs it
//! once at [`StageError::severity`] and moves on to the next message.

use log::Level;
use thiserror::Error;

use crate::contracts::ContractError;
use crate::router::PredictorError;

#[derive(Debug, Error)]
pub enum StageError {
    /// Payload is not JSON (or not the JSON shape the stage can read at all)
    #[error("malformed payload on {topic}: {detail}")]
    Malformed { topic: String, detail: String },

    #[error("message on {topic} has no machine_id")]
    MissingIdentity { topic: String },

    /// A peer sent something that fails our contract
    #[error("inbound {contract} for {entity} rejected: {source}")]
    InboundContract {
        contract: &'static str,
        entity: String,
        #[source]
        source: ContractError,
    },

    /// We built something that fails our own contract
    #[error("generated {contract} for {entity} failed validation (internal error): {source}")]
    OutboundContract {
        contract: &'static str,
        entity: String,
        #[source]
        source: ContractError,
    },

    #[error("unknown {kind} type {found:?} for {entity}")]
    UnknownType {
        kind: &'static str,
        found: String,
        entity: String,
    },

    #[error("prediction failed for {entity}: {source}")]
    Predictor {
        entity: String,
        #[source]
        source: PredictorError,
    },
}

impl StageError {
    /// Inbound problems are the peer's fault (warn); outbound contract and
    /// predictor failures are our own defects (error).
    pub fn severity(&self) -> Level {
        match self {
            StageError::Malformed { .. }
            | StageError::MissingIdentity { .. }
            | StageError::InboundContract { .. }
            | StageError::UnknownType { .. } => Level::Warn,
            StageError::OutboundContract { .. } | StageError::Predictor { .. } => Level::Error,
        }
    }

    pub fn log(&self, agent_id: &str) {
        log::log!(self.severity(), "[{}] dropped message: {}", agent_id, self);
    }
}
