//! Position Monitor: the per-group position state machine and its exit rules.

pub mod monitor;
pub mod rules;

pub use monitor::{PositionMonitor, Transition};
pub use rules::ExitRules;
