use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("no contract registered for {0}")]
    UnknownContract(String),

    #[error("{contract} schema violation: {detail}")]
    Schema { contract: String, detail: String },

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("invalid schema document {name}: {detail}")]
    InvalidSchemaDocument { name: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ContractError {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, ContractError::VersionMismatch { .. })
    }
}
