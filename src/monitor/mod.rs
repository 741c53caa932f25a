//! Observability: correlates confirmations with the contexts behind them and
//! tracks which agents are alive

pub mod index;
pub mod sink;

pub use index::{CorrelationMatch, RecentContextIndex};
pub use sink::{ObservabilitySink, SinkEvent, SinkSettings};
