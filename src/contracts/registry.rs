//! Contract registry: named, versioned schemas and the validation gate

use jsonschema::Validator;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::builtin;
use super::error::ContractError;
use crate::messages::Contracted;

/// A compiled JSON Schema document and the version it describes
#[derive(Clone)]
pub struct Contract {
    pub name: String,
    pub version: String,
    document: Value,
    validator: Arc<Validator>,
}

impl Contract {
    pub fn document(&self) -> &Value {
        &self.document
    }
}

impl fmt::Debug for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contract")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Holds one contract per message type; the latest registration wins, both
/// for structure and for the version inbound messages must carry
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, Contract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the embedded v1.0.0 documents
    pub fn builtin() -> Result<Self, ContractError> {
        let mut registry = Self::new();
        for (name, version, document) in builtin::DOCUMENTS {
            registry.register_document(name, version, document)?;
        }
        Ok(registry)
    }

    /// Load every `<name>_v<version>.json` document in `dir`
    ///
    /// Files that do not follow the naming scheme are skipped with a warning;
    /// an unreadable or invalid document aborts the load.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ContractError> {
        let dir = dir.as_ref();
        let mut entries: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        // Deterministic "last wins" when two files name the same contract
        entries.sort();

        let mut registry = Self::new();
        for path in entries {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((name, version)) = stem.rsplit_once("_v") else {
                log::warn!("Skipping {}: expected <contract>_v<version>.json", path.display());
                continue;
            };
            let document = fs::read_to_string(&path)?;
            registry.register_document(name, version, &document)?;
            log::info!("Loaded contract {} v{} from {}", name, version, path.display());
        }

        Ok(registry)
    }

    /// Compile `schema` and make it the contract for `type_name`
    pub fn register(
        &mut self,
        type_name: &str,
        version: &str,
        schema: Value,
    ) -> Result<(), ContractError> {
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| ContractError::InvalidSchemaDocument {
                name: type_name.to_string(),
                detail: e.to_string(),
            })?;

        if let Some(previous) = self.contracts.get(type_name) {
            if previous.version != version {
                log::info!(
                    "Contract {} moves from v{} to v{}",
                    type_name,
                    previous.version,
                    version
                );
            }
        }

        self.contracts.insert(
            type_name.to_string(),
            Contract {
                name: type_name.to_string(),
                version: version.to_string(),
                document: schema,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    pub fn register_document(
        &mut self,
        type_name: &str,
        version: &str,
        document: &str,
    ) -> Result<(), ContractError> {
        let schema: Value =
            serde_json::from_str(document).map_err(|e| ContractError::InvalidSchemaDocument {
                name: type_name.to_string(),
                detail: e.to_string(),
            })?;
        self.register(type_name, version, schema)
    }

    /// Fail unless every named contract is registered
    pub fn require(&self, names: &[&str]) -> Result<(), ContractError> {
        match names.iter().find(|name| !self.contracts.contains_key(**name)) {
            Some(missing) => Err(ContractError::UnknownContract((*missing).to_string())),
            None => Ok(()),
        }
    }

    pub fn get(&self, type_name: &str) -> Option<&Contract> {
        self.contracts.get(type_name)
    }

    pub fn supported_version(&self, type_name: &str) -> Option<&str> {
        self.contracts.get(type_name).map(|c| c.version.as_str())
    }

    /// Version to stamp on outgoing `type_name` messages
    ///
    /// Empty when the contract is not registered; outbound validation then
    /// rejects the message as [`ContractError::UnknownContract`].
    pub fn version_of(&self, type_name: &str) -> String {
        self.supported_version(type_name)
            .unwrap_or_default()
            .to_string()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    fn contract(&self, type_name: &str) -> Result<&Contract, ContractError> {
        self.contracts
            .get(type_name)
            .ok_or_else(|| ContractError::UnknownContract(type_name.to_string()))
    }

    /// Structural validation only; versions are checked by [`Self::check_version`]
    pub fn validate(&self, message: &Value, type_name: &str) -> Result<(), ContractError> {
        let contract = self.contract(type_name)?;

        match contract.validator.iter_errors(message).next() {
            None => Ok(()),
            Some(error) => Err(ContractError::Schema {
                contract: type_name.to_string(),
                detail: error.to_string(),
            }),
        }
    }

    /// Exact string equality on the top-level `schema_version` field
    pub fn check_version(message: &Value, expected_version: &str) -> Result<(), ContractError> {
        let actual = message
            .get("schema_version")
            .and_then(Value::as_str)
            .unwrap_or("<missing>");

        if actual == expected_version {
            Ok(())
        } else {
            Err(ContractError::VersionMismatch {
                expected: expected_version.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// [`Self::check_version`] against the version registered for `type_name`
    pub fn check_supported_version(
        &self,
        message: &Value,
        type_name: &str,
    ) -> Result<(), ContractError> {
        let contract = self.contract(type_name)?;
        Self::check_version(message, &contract.version)
    }

    /// Serialize an outbound message and validate it against its own contract
    pub fn validate_outbound<T>(&self, message: &T) -> Result<Value, ContractError>
    where
        T: Contracted + Serialize,
    {
        let value = serde_json::to_value(message)?;
        self.validate(&value, T::CONTRACT)?;
        Ok(value)
    }
}
