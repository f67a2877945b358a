//! Performance metrics: pure functions over equity curves and return series.
//!
//! Every metric is a pure function: equity values or dated returns in,
//! scalar out. Monthly statistics are `None` when the curve does not span two
//! calendar months, so callers can tell "undefined" from "zero".

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::EquityCurve;

/// Summary metrics of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimMetrics {
    pub trades: usize,
    pub net_return: f64,
    pub max_drawdown: f64,
    pub avg_monthly_return: Option<f64>,
    pub worst_month: Option<f64>,
}

impl SimMetrics {
    pub fn compute(curve: &EquityCurve, trades: usize) -> Self {
        let values = curve.values();
        let monthly = monthly_returns(curve);
        Self {
            trades,
            net_return: net_return(&values),
            max_drawdown: max_drawdown(&values),
            avg_monthly_return: (!monthly.is_empty()).then(|| mean(&monthly)),
            worst_month: monthly.iter().copied().reduce(f64::min),
        }
    }
}

/// last / first - 1; zero for fewer than two values or a non-positive start.
pub fn net_return(equity: &[f64]) -> f64 {
    match (equity.first(), equity.last()) {
        (Some(&first), Some(&last)) if equity.len() >= 2 && first > 0.0 => last / first - 1.0,
        _ => 0.0,
    }
}

/// Maximum drawdown as a negative fraction (e.g., -0.15 = 15% drawdown).
///
/// Returns 0.0 if equity is constant or monotonically increasing.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let Some(&first) = equity.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd = 0.0_f64;
    for &eq in equity {
        if eq > peak {
            peak = eq;
        }
        if peak > 0.0 {
            max_dd = max_dd.min(eq / peak - 1.0);
        }
    }
    max_dd
}

/// Percentage changes between consecutive month-end values.
pub fn monthly_returns(curve: &EquityCurve) -> Vec<f64> {
    pct_changes(curve.month_end_last().iter().map(|(_, v)| *v))
}

/// Daily percentage changes keyed by the later day.
pub fn daily_returns(curve: &EquityCurve) -> Vec<(NaiveDate, f64)> {
    let daily = curve.daily_last();
    daily
        .windows(2)
        .filter_map(|w| {
            let r = w[1].1 / w[0].1 - 1.0;
            r.is_finite().then_some((w[1].0, r))
        })
        .collect()
}

fn pct_changes(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let values: Vec<f64> = values.collect();
    values
        .windows(2)
        .map(|w| w[1] / w[0] - 1.0)
        .filter(|r| r.is_finite())
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n-1). `None` for fewer than two values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Pearson correlation over the dates both series share.
///
/// `None` when fewer than two common dates exist or either side has zero
/// variance on them.
pub fn correlation(a: &[(NaiveDate, f64)], b: &[(NaiveDate, f64)]) -> Option<f64> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                xs.push(a[i].1);
                ys.push(b[j].1);
                i += 1;
                j += 1;
            }
        }
    }
    if xs.len() < 2 {
        return None;
    }
    let (mx, my) = (mean(&xs), mean(&ys));
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx <= 0.0 || vy <= 0.0 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}
