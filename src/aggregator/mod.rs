//! Context aggregation: per-machine windows and anomaly flagging

pub mod context;
pub mod detector;

pub use context::{AggregatorSettings, ContextAggregator, WindowSummary};
pub use detector::AnomalyDetector;
