//! Backtest engine: risk sizing and the bar-by-bar simulator.

pub mod simulator;
pub mod sizing;

pub use simulator::{run_backtest, SimConfig, SimError, SimResult};
pub use sizing::position_notional;
