//! Paper runner: replay the weighted portfolio over recent history.
//!
//! Each weighted strategy is re-simulated on the trailing `lookback_days` of
//! its market. Per-bar returns of the normalised curves are aligned on the
//! union of timestamps (a strategy without a bar at some instant contributes
//! a zero return), weight-summed and compounded from starting capital.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use perplab_core::domain::{EquityCurve, ExitReason, Market, Side, StrategyDescriptor, Timeframe, Trade};
use perplab_core::engine::{run_backtest, SimConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::export::{write_csv, write_json};
use crate::market_data::MarketData;
use crate::router::DescriptorBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperStatus {
    Ok,
    NoSeries,
}

/// A strategy that contributed to the paper curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedStrategy {
    pub key: String,
    pub weight: f64,
    pub symbol: Market,
    pub timeframe: Timeframe,
    pub fast: usize,
    pub slow: usize,
    pub stop_loss_pct: f64,
}

/// One simulated round trip, tagged with its strategy and weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperTrade {
    pub strategy_key: String,
    pub weight: f64,
    pub symbol: Market,
    pub timeframe: Timeframe,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub quantity: f64,
    pub gross_pnl: f64,
    pub fees: f64,
    pub funding: f64,
    pub net_pnl: f64,
    pub exit_reason: ExitReason,
    /// Loss at the initial stop: entry-to-stop distance times quantity.
    pub risk_amount: f64,
}

impl PaperTrade {
    fn new(key: &str, weight: f64, d: &StrategyDescriptor, t: &Trade) -> Self {
        let stop = t.side.stop_from(t.entry_price, d.stop_loss_pct());
        Self {
            strategy_key: key.to_string(),
            weight,
            symbol: d.market(),
            timeframe: d.timeframe(),
            side: t.side,
            entry_time: t.entry_time,
            entry_price: t.entry_price,
            exit_time: t.exit_time,
            exit_price: t.exit_price,
            quantity: t.quantity,
            gross_pnl: t.gross_pnl,
            fees: t.fees,
            funding: t.funding,
            net_pnl: t.net_pnl,
            exit_reason: t.exit_reason,
            risk_amount: (t.entry_price - stop).abs() * t.quantity,
        }
    }

    fn hold_minutes(&self) -> f64 {
        (self.exit_time - self.entry_time).num_seconds() as f64 / 60.0
    }

    /// Net P&L in units of initial risk; `None` without a risk amount.
    fn r_multiple(&self) -> Option<f64> {
        (self.risk_amount > 0.0).then(|| self.net_pnl / self.risk_amount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub status: PaperStatus,
    pub lookback_days: i64,
    pub used: Vec<UsedStrategy>,
}

#[derive(Debug, Clone)]
pub struct PaperReport {
    pub meta: RunMeta,
    pub equity: EquityCurve,
    pub trades: Vec<PaperTrade>,
}

/// Per-bar returns of a curve normalised to 1.0; the first bar returns 0.
fn bar_returns(curve: &EquityCurve) -> Vec<(DateTime<Utc>, f64)> {
    let norm = curve.normalized();
    let points = norm.points();
    points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let r = match i.checked_sub(1).map(|j| points[j].equity) {
                Some(prev) if prev != 0.0 => p.equity / prev - 1.0,
                _ => 0.0,
            };
            (p.time, r)
        })
        .collect()
}

/// Run the paper replay for every key in `weights`.
///
/// Keys that do not resolve, markets without data, and simulations that fail
/// are skipped. With nothing left the report is `NoSeries` with an empty
/// curve.
pub fn run_paper(
    data: &dyn MarketData,
    book: &DescriptorBook,
    weights: &BTreeMap<String, f64>,
    lookback_days: i64,
    sim: &SimConfig,
) -> PaperReport {
    let mut used = Vec::new();
    let mut trades = Vec::new();
    // time → weighted return summed over strategies
    let mut blended: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();

    for (key, &weight) in weights {
        let Some(d) = book.resolve(key) else {
            warn!(%key, "cannot resolve descriptor, not replayed");
            continue;
        };
        let Some(table) = data.table(d.market()) else {
            debug!(%key, "no price data");
            continue;
        };
        let window = match table.last_time() {
            Some(last) if lookback_days > 0 => table.since(last - Duration::days(lookback_days)),
            _ => table.clone(),
        };
        let result = match run_backtest(&window, &d, sim) {
            Ok(r) => r,
            Err(e) => {
                warn!(%key, error = %e, "paper replay failed");
                continue;
            }
        };
        if result.equity.is_empty() {
            continue;
        }

        for (time, r) in bar_returns(&result.equity) {
            *blended.entry(time).or_insert(0.0) += weight * r;
        }
        trades.extend(result.trades.iter().map(|t| PaperTrade::new(key, weight, &d, t)));
        used.push(UsedStrategy {
            key: key.clone(),
            weight,
            symbol: d.market(),
            timeframe: d.timeframe(),
            fast: d.fast(),
            slow: d.slow(),
            stop_loss_pct: d.stop_loss_pct(),
        });
    }

    if used.is_empty() {
        info!(weights = weights.len(), "paper run found no series");
        return PaperReport {
            meta: RunMeta {
                status: PaperStatus::NoSeries,
                lookback_days,
                used,
            },
            equity: EquityCurve::new(),
            trades,
        };
    }

    let mut level = sim.starting_capital;
    let equity: EquityCurve = blended
        .into_iter()
        .map(|(time, r)| {
            level *= 1.0 + r;
            (time, level)
        })
        .collect();
    info!(
        strategies = used.len(),
        trades = trades.len(),
        last_equity = equity.last().unwrap_or(sim.starting_capital),
        "paper run finished"
    );

    PaperReport {
        meta: RunMeta {
            status: PaperStatus::Ok,
            lookback_days,
            used,
        },
        equity,
        trades,
    }
}

#[derive(Debug, Serialize)]
struct EquityRow {
    time: String,
    equity: f64,
}

/// Write `run_meta.json`, and on success `paper_equity.csv` and `trades.csv`.
pub fn write_paper_artifacts(dir: &Path, report: &PaperReport) -> Result<()> {
    write_json(&dir.join("run_meta.json"), &report.meta)?;
    if report.meta.status == PaperStatus::NoSeries {
        return Ok(());
    }
    let rows: Vec<EquityRow> = report
        .equity
        .points()
        .iter()
        .map(|p| EquityRow {
            time: p.time.to_rfc3339(),
            equity: p.equity,
        })
        .collect();
    write_csv(&dir.join("paper_equity.csv"), &rows)?;
    write_csv(&dir.join("trades.csv"), &report.trades)
}

// ─── Trade summary ───────────────────────────────────────────────────

/// Key of the all-strategies row appended to the per-strategy summary.
pub const PORTFOLIO_ROW: &str = "__PORTFOLIO__";

/// Aggregates over one group of closed trades.
///
/// A trade counts as a win when its net P&L is at least zero. R-multiple
/// averages skip trades without a risk amount and are `None` when no trade
/// has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummaryRow {
    pub strategy_key: String,
    pub symbol: String,
    pub timeframe: String,
    pub n_trades: usize,
    pub win_rate: f64,
    pub avg_hold_min: f64,
    pub gross_pnl_sum: f64,
    pub fees_sum: f64,
    pub funding_sum: f64,
    pub net_pnl_sum: f64,
    pub avg_net_per_trade: f64,
    #[serde(rename = "avg_R")]
    pub avg_r: Option<f64>,
    #[serde(rename = "median_R")]
    pub median_r: Option<f64>,
}

/// Closed trades grouped by market and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    pub symbol: Market,
    pub timeframe: Timeframe,
    pub n_trades: usize,
    pub net_pnl: f64,
    pub win_rate: f64,
    #[serde(rename = "avg_R")]
    pub avg_r: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeSummary {
    /// Per strategy, best net P&L first, then the portfolio row. Empty
    /// when there are no trades.
    pub strategies: Vec<StrategySummaryRow>,
    pub buckets: Vec<BucketRow>,
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

fn win_rate(trades: &[&PaperTrade]) -> f64 {
    let wins = trades.iter().filter(|t| t.net_pnl >= 0.0).count();
    wins as f64 / trades.len() as f64
}

fn r_multiples(trades: &[&PaperTrade]) -> Vec<f64> {
    trades.iter().filter_map(|t| t.r_multiple()).collect()
}

fn summarize_group(
    key: &str,
    symbol: String,
    timeframe: String,
    trades: &[&PaperTrade],
) -> StrategySummaryRow {
    let n = trades.len() as f64;
    let sum = |f: fn(&PaperTrade) -> f64| trades.iter().map(|t| f(t)).sum::<f64>();
    let rs = r_multiples(trades);
    let net = sum(|t| t.net_pnl);
    StrategySummaryRow {
        strategy_key: key.to_string(),
        symbol,
        timeframe,
        n_trades: trades.len(),
        win_rate: win_rate(trades),
        avg_hold_min: sum(PaperTrade::hold_minutes) / n,
        gross_pnl_sum: sum(|t| t.gross_pnl),
        fees_sum: sum(|t| t.fees),
        funding_sum: sum(|t| t.funding),
        net_pnl_sum: net,
        avg_net_per_trade: net / n,
        avg_r: mean(&rs),
        median_r: median(&rs),
    }
}

/// Per-strategy and per-bucket statistics over closed paper trades.
pub fn summarize_trades(trades: &[PaperTrade]) -> TradeSummary {
    if trades.is_empty() {
        return TradeSummary::default();
    }

    let mut by_key: BTreeMap<&str, Vec<&PaperTrade>> = BTreeMap::new();
    let mut by_bucket: BTreeMap<(Market, Timeframe), Vec<&PaperTrade>> = BTreeMap::new();
    for t in trades {
        by_key.entry(t.strategy_key.as_str()).or_default().push(t);
        by_bucket.entry((t.symbol, t.timeframe)).or_default().push(t);
    }

    let mut strategies: Vec<StrategySummaryRow> = by_key
        .into_iter()
        .map(|(key, group)| {
            let first = group[0];
            summarize_group(key, first.symbol.to_string(), first.timeframe.to_string(), &group)
        })
        .collect();
    strategies.sort_by(|a, b| b.net_pnl_sum.total_cmp(&a.net_pnl_sum));
    let all: Vec<&PaperTrade> = trades.iter().collect();
    strategies.push(summarize_group(PORTFOLIO_ROW, "ALL".into(), "-".into(), &all));

    let buckets = by_bucket
        .into_iter()
        .map(|((symbol, timeframe), group)| BucketRow {
            symbol,
            timeframe,
            n_trades: group.len(),
            net_pnl: group.iter().map(|t| t.net_pnl).sum(),
            win_rate: win_rate(&group),
            avg_r: mean(&r_multiples(&group)),
        })
        .collect();

    TradeSummary {
        strategies,
        buckets,
    }
}

/// Write `trade_summary.csv` and `trades_by_bucket.csv` into `dir`.
pub fn write_trade_summary(dir: &Path, summary: &TradeSummary) -> Result<()> {
    write_csv(&dir.join("trade_summary.csv"), &summary.strategies)?;
    write_csv(&dir.join("trades_by_bucket.csv"), &summary.buckets)?;
    info!(
        strategies = summary.strategies.len().saturating_sub(1),
        buckets = summary.buckets.len(),
        "trade summary written"
    );
    Ok(())
}
