//! Multi-split forward (out-of-sample) evaluation.
//!
//! The trailing `oos_fraction` of each market's native bars is cut into N
//! contiguous segments; the last one absorbs the remainder. Every descriptor
//! is simulated on every segment and judged by the acceptance rule. A
//! descriptor is accepted overall when it passes in at least `min_passes`
//! segments, aggregated by base key (timeframe-agnostic).

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use perplab_core::domain::{Market, StrategyDescriptor};
use perplab_core::engine::SimConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::acceptance::{apply_acceptance, write_acceptance_artifacts, AcceptanceReport};
use crate::backtest::{backtest_all, MetricsRow};
use crate::config::{AcceptanceConfig, ForwardConfig};
use crate::export::{save_descriptors, write_csv, write_json};
use crate::market_data::{MarketData, MarketTables};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForwardError {
    #[error("split count must be at least 1")]
    NoSplits,
    #[error("oos fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
    #[error("{bars} out-of-sample bars cannot form {splits} segments")]
    TooShort { bars: usize, splits: usize },
}

/// Half-open native bar range `[start, end)` of one out-of-sample segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Partition the trailing `floor(total * oos_fraction)` bars into `n` segments.
pub fn split_segments(
    total: usize,
    oos_fraction: f64,
    n: usize,
) -> Result<Vec<Segment>, ForwardError> {
    if n == 0 {
        return Err(ForwardError::NoSplits);
    }
    if !(oos_fraction > 0.0 && oos_fraction <= 1.0) {
        return Err(ForwardError::InvalidFraction(oos_fraction));
    }
    let oos = ((total as f64 * oos_fraction).floor() as usize).clamp(1, total.max(1));
    let seg = oos / n;
    if seg == 0 || total == 0 {
        return Err(ForwardError::TooShort {
            bars: oos,
            splits: n,
        });
    }
    let first = total - oos;
    Ok((0..n)
        .map(|i| Segment {
            start: first + i * seg,
            end: if i + 1 == n { total } else { first + (i + 1) * seg },
        })
        .collect())
}

// ─── Evaluation ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SplitResult {
    pub index: usize,
    pub metrics: Vec<MetricsRow>,
    pub acceptance: AcceptanceReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardSummary {
    pub per_split_counts: Vec<usize>,
    pub accepted_aggregated: usize,
    pub splits: usize,
    pub min_passes: usize,
}

#[derive(Debug, Clone)]
pub struct ForwardReport {
    pub splits: Vec<SplitResult>,
    /// Globally accepted descriptors, in order of first acceptance.
    pub aggregated: Vec<StrategyDescriptor>,
    pub summary: ForwardSummary,
}

/// Evaluate `descriptors` on every out-of-sample segment of their market.
pub fn evaluate_forward(
    data: &dyn MarketData,
    descriptors: &[StrategyDescriptor],
    forward: &ForwardConfig,
    acceptance: &AcceptanceConfig,
    sim: &SimConfig,
) -> Result<ForwardReport, ForwardError> {
    if forward.n_splits == 0 {
        return Err(ForwardError::NoSplits);
    }

    // Segment every usable market up front.
    let mut segments: HashMap<_, Vec<Segment>> = HashMap::new();
    for market in Market::ALL {
        let Some(table) = data.table(market) else {
            continue;
        };
        if table.len() < forward.min_history_bars {
            warn!(%market, bars = table.len(), min = forward.min_history_bars, "history too short, skipping");
            continue;
        }
        match split_segments(table.len(), forward.oos_fraction, forward.n_splits) {
            Ok(s) => {
                segments.insert(market, s);
            }
            Err(ForwardError::TooShort { bars, splits }) => {
                warn!(%market, bars, splits, "cannot segment market, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    let mut splits = Vec::with_capacity(forward.n_splits);
    for index in 0..forward.n_splits {
        let mut split_data = MarketTables::new();
        for (&market, segs) in &segments {
            if let Some(table) = data.table(market) {
                let seg = segs[index];
                split_data.insert(market, table.slice(seg.start, seg.end));
            }
        }
        let metrics = backtest_all(&split_data, descriptors, sim);
        let acceptance = apply_acceptance(&metrics, descriptors, acceptance);
        info!(
            split = index + 1,
            evaluated = metrics.len(),
            accepted = acceptance.accepted.len(),
            "forward split done"
        );
        splits.push(SplitResult {
            index,
            metrics,
            acceptance,
        });
    }

    let min_passes = forward.effective_min_passes();
    let aggregated = aggregate_passes(&splits, min_passes);
    let summary = ForwardSummary {
        per_split_counts: splits.iter().map(|s| s.acceptance.accepted.len()).collect(),
        accepted_aggregated: aggregated.len(),
        splits: forward.n_splits,
        min_passes,
    };
    Ok(ForwardReport {
        splits,
        aggregated,
        summary,
    })
}

/// Count passes per base key; the first accepting descriptor is canonical.
fn aggregate_passes(splits: &[SplitResult], min_passes: usize) -> Vec<StrategyDescriptor> {
    let mut order: Vec<(StrategyDescriptor, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for split in splits {
        for d in &split.acceptance.accepted {
            match index.get(&d.base_key()) {
                Some(&i) => order[i].1 += 1,
                None => {
                    index.insert(d.base_key(), order.len());
                    order.push((d.clone(), 1));
                }
            }
        }
    }
    order
        .into_iter()
        .filter(|(_, passes)| *passes >= min_passes)
        .map(|(d, _)| d)
        .collect()
}

/// Write per-split directories, the aggregate collection and the summary.
pub fn write_forward_artifacts(dir: &Path, report: &ForwardReport) -> Result<()> {
    for split in &report.splits {
        let split_dir = dir.join(format!("split_{:02}", split.index + 1));
        write_csv(&split_dir.join("metrics.csv"), &split.metrics)?;
        write_acceptance_artifacts(&split_dir, &split.acceptance)?;
    }
    save_descriptors(&dir.join("accepted_strategies.json"), &report.aggregated)?;
    write_json(&dir.join("summary.json"), &report.summary)
}
