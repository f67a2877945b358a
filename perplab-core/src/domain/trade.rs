//! Completed trades and the simulator's structured event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::Side;

/// Why a simulated position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Stop,
    Reversal,
}

/// A round trip from entry fill to exit fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub quantity: f64,
    /// Price move times quantity, before fees and funding.
    pub gross_pnl: f64,
    /// Entry plus exit fee.
    pub fees: f64,
    /// Net funding received (negative when paid).
    pub funding: f64,
    pub net_pnl: f64,
    pub exit_reason: ExitReason,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.net_pnl > 0.0
    }
}

/// Kind of event recorded by the simulator in extended mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimEventKind {
    Entry,
    ExitStop,
    ExitReversal,
    Funding,
}

/// One entry, exit or funding settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub time: DateTime<Utc>,
    pub kind: SimEventKind,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    /// Realized amount: price P&L for exits, funding flow for funding events.
    pub pnl: f64,
    pub equity_after: f64,
}
