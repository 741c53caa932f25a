//! Windowed machine-telemetry pipeline
//!
//! Raw sensor readings become per-machine contexts, contexts become
//! maintenance decisions, decisions become (simulated) actions and
//! confirmations. Every hop is gated by a versioned message contract.

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod contracts;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod monitor;
pub mod pipeline;
pub mod router;
pub mod window;

pub use config::PipelineConfig;
pub use contracts::ContractRegistry;
pub use error::StageError;
pub use pipeline::{Pipeline, PipelineHandle};
