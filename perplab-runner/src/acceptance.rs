//! Acceptance thresholds applied to metrics tables.
//!
//! A row is rejected when it trades too little or draws down too far. Rows
//! that span at least two calendar months must also clear the monthly
//! floors and show a positive net return; shorter rows only need the
//! positive net return.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use perplab_core::domain::{Market, StrategyDescriptor, Timeframe};
use perplab_core::metrics::SimMetrics;
use serde::{Deserialize, Serialize};

use crate::backtest::MetricsRow;
use crate::config::AcceptanceConfig;
use crate::export::{save_descriptors, write_csv};

/// Outcome of the acceptance rule for one metrics row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        self.reasons.is_empty()
    }

    /// Semicolon-joined rejection reasons; empty when accepted.
    pub fn reason(&self) -> String {
        self.reasons.join(";")
    }
}

pub fn evaluate(m: &SimMetrics, th: &AcceptanceConfig) -> Verdict {
    let mut reasons = Vec::new();
    if m.trades < th.min_trades {
        reasons.push(format!("trades<{}", th.min_trades));
    }
    if m.max_drawdown < -th.max_drawdown_abs_max {
        reasons.push(format!("max_drawdown>{:.0}%", th.max_drawdown_abs_max * 100.0));
    }
    if let (Some(avg), Some(worst)) = (m.avg_monthly_return, m.worst_month) {
        if avg < th.avg_monthly_return_min {
            reasons.push(format!(
                "avg_monthly_return<{:.2}%",
                th.avg_monthly_return_min * 100.0
            ));
        }
        if worst <= th.worst_month_min {
            reasons.push(format!("worst_month<={:.0}%", th.worst_month_min * 100.0));
        }
    }
    if m.net_return <= 0.0 {
        reasons.push("net_return<=0".to_string());
    }
    Verdict { reasons }
}

/// Metrics row with its acceptance flag, as written to CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedMetricsRow {
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
    pub accepted: bool,
    pub reason: String,
}

impl AcceptedMetricsRow {
    fn new(row: &MetricsRow, verdict: &Verdict) -> Self {
        let row = row.clone();
        Self {
            key: row.key,
            symbol: row.symbol,
            timeframe: row.timeframe,
            fast: row.fast,
            slow: row.slow,
            stop_loss_pct: row.stop_loss_pct,
            trades: row.trades,
            net_return: row.net_return,
            max_drawdown: row.max_drawdown,
            avg_monthly_return: row.avg_monthly_return,
            worst_month: row.worst_month,
            accepted: verdict.accepted(),
            reason: verdict.reason(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcceptanceReport {
    /// Every row, flagged.
    pub rows: Vec<AcceptedMetricsRow>,
    /// Descriptors whose rows were accepted, in descriptor order.
    pub accepted: Vec<StrategyDescriptor>,
}

impl AcceptanceReport {
    pub fn accepted_rows(&self) -> Vec<AcceptedMetricsRow> {
        self.rows.iter().filter(|r| r.accepted).cloned().collect()
    }
}

/// Flag every row and pick the matching accepted descriptors by key.
pub fn apply_acceptance(
    rows: &[MetricsRow],
    descriptors: &[StrategyDescriptor],
    th: &AcceptanceConfig,
) -> AcceptanceReport {
    let flagged: Vec<AcceptedMetricsRow> = rows
        .iter()
        .map(|r| AcceptedMetricsRow::new(r, &evaluate(&r.metrics(), th)))
        .collect();
    let keys: HashSet<&str> = flagged
        .iter()
        .filter(|r| r.accepted)
        .map(|r| r.key.as_str())
        .collect();
    let accepted = descriptors
        .iter()
        .filter(|d| keys.contains(d.key().as_str()))
        .cloned()
        .collect();
    AcceptanceReport {
        rows: flagged,
        accepted,
    }
}

/// Write `metrics_with_flags.csv`, `accepted_metrics.csv` and
/// `accepted_strategies.json` into `dir`.
pub fn write_acceptance_artifacts(dir: &Path, report: &AcceptanceReport) -> Result<()> {
    write_csv(&dir.join("metrics_with_flags.csv"), &report.rows)?;
    write_csv(&dir.join("accepted_metrics.csv"), &report.accepted_rows())?;
    save_descriptors(&dir.join("accepted_strategies.json"), &report.accepted)
}
