//! Batch backtests: every descriptor over the full history of its market.

use std::path::Path;

use anyhow::Result;
use perplab_core::domain::{Market, StrategyDescriptor, Timeframe};
use perplab_core::engine::{run_backtest, SimConfig};
use perplab_core::metrics::SimMetrics;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::export::{save_descriptors, write_csv};
use crate::market_data::MarketData;

/// One row of the metrics table. Undefined monthly statistics are empty cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub key: String,
    pub symbol: Market,
    pub timeframe: Timeframe,
    pub fast: usize,
    pub slow: usize,
    pub stop_loss_pct: f64,
    pub trades: usize,
    pub net_return: f64,
    pub max_drawdown: f64,
    pub avg_monthly_return: Option<f64>,
    pub worst_month: Option<f64>,
}

impl MetricsRow {
    pub fn new(descriptor: &StrategyDescriptor, metrics: &SimMetrics) -> Self {
        Self {
            key: descriptor.key(),
            symbol: descriptor.market(),
            timeframe: descriptor.timeframe(),
            fast: descriptor.fast(),
            slow: descriptor.slow(),
            stop_loss_pct: descriptor.stop_loss_pct(),
            trades: metrics.trades,
            net_return: metrics.net_return,
            max_drawdown: metrics.max_drawdown,
            avg_monthly_return: metrics.avg_monthly_return,
            worst_month: metrics.worst_month,
        }
    }

    pub fn metrics(&self) -> SimMetrics {
        SimMetrics {
            trades: self.trades,
            net_return: self.net_return,
            max_drawdown: self.max_drawdown,
            avg_monthly_return: self.avg_monthly_return,
            worst_month: self.worst_month,
        }
    }
}

/// Backtest every descriptor against its market's table.
///
/// Descriptors whose market has no table, or whose simulation fails, are
/// logged and skipped; the batch always completes.
pub fn backtest_all(
    data: &dyn MarketData,
    descriptors: &[StrategyDescriptor],
    sim: &SimConfig,
) -> Vec<MetricsRow> {
    let mut rows = Vec::with_capacity(descriptors.len());
    for d in descriptors {
        let Some(table) = data.table(d.market()) else {
            warn!(key = %d.key(), "no price data, skipping");
            continue;
        };
        match run_backtest(table, d, sim) {
            Ok(result) => rows.push(MetricsRow::new(d, &result.metrics)),
            Err(e) => warn!(key = %d.key(), error = %e, "backtest failed, skipping"),
        }
    }
    info!(
        requested = descriptors.len(),
        completed = rows.len(),
        "batch backtest finished"
    );
    rows
}

/// Write `metrics.csv` and `strategies.json` into `dir`.
pub fn write_backtest_artifacts(
    dir: &Path,
    descriptors: &[StrategyDescriptor],
    rows: &[MetricsRow],
) -> Result<()> {
    save_descriptors(&dir.join("strategies.json"), descriptors)?;
    write_csv(&dir.join("metrics.csv"), rows)
}
