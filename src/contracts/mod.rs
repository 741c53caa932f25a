//! Message contracts
//!
//! Every message that crosses a stage boundary is checked twice:
//!
//! ```text
//! payload ──► ContractRegistry::validate (compiled JSON Schema)
//!         ──► ContractRegistry::check_supported_version (exact string equality
//!             against the version registered for that contract)
//! ```
//!
//! Versions are pinned, not ranged: a producer and its consumers are upgraded
//! together. Contract documents live in `schemas/<name>_v<version>.json`.

pub mod builtin;
pub mod error;
pub mod registry;

pub use error::ContractError;
pub use registry::{Contract, ContractRegistry};

pub const RAW_MACHINE_DATA: &str = "raw_machine_data";
pub const PROCESSED_MACHINE_CONTEXT: &str = "processed_machine_context";
pub const MAINTENANCE_DECISION: &str = "maintenance_decision";
pub const ACTION_CONFIRMATION: &str = "action_confirmation";
pub const AGENT_HEARTBEAT: &str = "agent_heartbeat";

/// Contracts the runtime cannot start without
pub const ALL_CONTRACTS: [&str; 5] = [
    RAW_MACHINE_DATA,
    PROCESSED_MACHINE_CONTEXT,
    MAINTENANCE_DECISION,
    ACTION_CONFIRMATION,
    AGENT_HEARTBEAT,
];
