//! Domain types for PerpLab

pub mod bar;
pub mod descriptor;
pub mod equity;
pub mod market;
pub mod position;
pub mod trade;

pub use bar::Bar;
pub use descriptor::{split_key, ConfigError, RawDescriptor, StrategyDescriptor};
pub use equity::{EquityCurve, EquityPoint};
pub use market::{Direction, Market, Side, Timeframe};
pub use position::{OpenPosition, PositionState, RawOpenPosition};
pub use trade::{ExitReason, SimEvent, SimEventKind, Trade};
