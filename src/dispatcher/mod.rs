//! Action dispatch: decisions are executed (or simulated) and confirmed

pub mod action;
pub mod executor;

pub use action::{ActionDispatcher, DispatcherSettings};
pub use executor::{ActionExecutor, ActionOutcome, DecisionKind, SimulatedExecutor};
