//! Append-only order/event log (`orders_log.csv`).

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use perplab_core::domain::{Market, Side, StrategyDescriptor, Timeframe};
use serde::{Deserialize, Serialize};

use super::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Open,
    CloseStop,
    CloseFlip,
    CloseAll,
    Killswitch,
    DayRollover,
}

/// One log row. Account-level events leave the trade columns empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub time: DateTime<Utc>,
    pub strategy_key: String,
    pub symbol: Option<Market>,
    pub timeframe: Option<Timeframe>,
    pub event: LedgerEvent,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub qty: Option<f64>,
    pub fee: Option<f64>,
    pub pnl: Option<f64>,
    pub equity_after: f64,
    pub reason: String,
}

impl LedgerEntry {
    /// Entry for a fill on `descriptor`'s strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        time: DateTime<Utc>,
        key: &str,
        descriptor: Option<&StrategyDescriptor>,
        event: LedgerEvent,
        side: Side,
        price: f64,
        qty: f64,
        fee: f64,
        pnl: f64,
        equity_after: f64,
        reason: &str,
    ) -> Self {
        Self {
            time,
            strategy_key: key.to_string(),
            symbol: descriptor.map(StrategyDescriptor::market),
            timeframe: descriptor.map(StrategyDescriptor::timeframe),
            event,
            side: Some(side),
            price: Some(price),
            qty: Some(qty),
            fee: Some(fee),
            pnl: Some(pnl),
            equity_after,
            reason: reason.to_string(),
        }
    }

    /// Account-level entry (kill-switch, day rollover).
    pub fn account(time: DateTime<Utc>, event: LedgerEvent, equity_after: f64, reason: &str) -> Self {
        Self {
            time,
            strategy_key: String::new(),
            symbol: None,
            timeframe: None,
            event,
            side: None,
            price: None,
            qty: None,
            fee: None,
            pnl: None,
            equity_after,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderLedger {
    path: PathBuf,
}

impl OrderLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new or empty.
    pub fn append(&self, entry: &LedgerEntry) -> Result<(), RouterError> {
        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| RouterError::Io {
                path: self.path.clone(),
                source,
            })?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        wtr.serialize(entry)?;
        wtr.flush().map_err(|source| RouterError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Every row so far; empty when the log does not exist.
    pub fn read_all(&self) -> Result<Vec<LedgerEntry>, RouterError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut out = Vec::new();
        for row in rdr.deserialize() {
            out.push(row?);
        }
        Ok(out)
    }
}
