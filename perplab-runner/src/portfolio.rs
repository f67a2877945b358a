//! Portfolio construction from accepted descriptors.
//!
//! Pipeline: full-history re-simulation → daily returns → score →
//! greedy correlation-bounded selection → inverse-volatility weights →
//! per-strategy and per-market cap waterfall → blended equity.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use perplab_core::domain::{EquityCurve, Market, StrategyDescriptor};
use perplab_core::engine::{run_backtest, SimConfig};
use perplab_core::metrics::{correlation, daily_returns, max_drawdown, mean, sample_std, SimMetrics};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PortfolioConfig;
use crate::export::{save_descriptors, write_csv, write_json};
use crate::market_data::MarketData;
use crate::router::DescriptorBook;

const CAP_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortfolioError {
    #[error("weights and markets differ in length ({weights} vs {markets})")]
    LengthMismatch { weights: usize, markets: usize },
    #[error("cap {field} = {value} must be in (0, 1]")]
    InvalidCap { field: &'static str, value: f64 },
}

// ─── Candidates ──────────────────────────────────────────────────────

/// A descriptor re-simulated over full history.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub descriptor: StrategyDescriptor,
    pub key: String,
    pub equity: EquityCurve,
    pub daily: Vec<(NaiveDate, f64)>,
    pub metrics: SimMetrics,
    pub score: f64,
}

/// mean daily return × 30 − 0.5 × |max drawdown|
pub fn score(daily: &[(NaiveDate, f64)], max_drawdown: f64) -> f64 {
    let values: Vec<f64> = daily.iter().map(|(_, r)| *r).collect();
    mean(&values) * 30.0 - 0.5 * (-max_drawdown).max(0.0)
}

pub fn build_candidates(
    data: &dyn MarketData,
    accepted: &[StrategyDescriptor],
    sim: &SimConfig,
) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(accepted.len());
    for d in accepted {
        let Some(table) = data.table(d.market()) else {
            warn!(key = %d.key(), "no price data, candidate dropped");
            continue;
        };
        let result = match run_backtest(table, d, sim) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %d.key(), error = %e, "re-simulation failed, candidate dropped");
                continue;
            }
        };
        let daily = daily_returns(&result.equity);
        out.push(Candidate {
            key: d.key(),
            score: score(&daily, result.metrics.max_drawdown),
            descriptor: d.clone(),
            equity: result.equity,
            daily,
            metrics: result.metrics,
        });
    }
    out
}

// ─── Selection ───────────────────────────────────────────────────────

/// Greedy selection by descending score.
///
/// A candidate is admitted only if its correlation with every admitted one is
/// at most `correlation_cap`; an undefined correlation never blocks. Returns
/// indices into `candidates`.
pub fn select_uncorrelated(
    candidates: &[Candidate],
    correlation_cap: f64,
    max_strategies: usize,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| candidates[b].score.total_cmp(&candidates[a].score));

    let mut chosen: Vec<usize> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for i in order {
        if chosen.len() >= max_strategies {
            break;
        }
        if !seen.insert(candidates[i].key.as_str()) {
            continue;
        }
        let blocked = chosen.iter().any(|&j| {
            correlation(&candidates[i].daily, &candidates[j].daily)
                .is_some_and(|c| c > correlation_cap)
        });
        if blocked {
            debug!(key = %candidates[i].key, "rejected on correlation");
            continue;
        }
        chosen.push(i);
    }
    chosen
}

// ─── Weights ─────────────────────────────────────────────────────────

/// Inverse-volatility weights normalised to one, then clipped at `max_weight`.
///
/// Zero or undefined volatility gets weight zero. All-zero input stays zero.
pub fn risk_parity_weights(daily: &[&[(NaiveDate, f64)]], max_weight: f64) -> Vec<f64> {
    let inverse: Vec<f64> = daily
        .iter()
        .map(|series| {
            let values: Vec<f64> = series.iter().map(|(_, r)| *r).collect();
            match sample_std(&values) {
                Some(vol) if vol > 0.0 && vol.is_finite() => 1.0 / vol,
                _ => 0.0,
            }
        })
        .collect();
    let total: f64 = inverse.iter().sum();
    inverse
        .iter()
        .map(|w| if total > 0.0 { (w / total).min(max_weight) } else { 0.0 })
        .collect()
}

/// Result of the cap waterfall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapOutcome {
    pub weights: Vec<f64>,
    /// True when every cap held and the total was one before the final
    /// renormalisation.
    pub converged: bool,
    pub iterations: usize,
    /// Largest amount by which any strategy or market exceeds its cap after
    /// renormalisation.
    pub residual_violation: f64,
}

fn market_sums(weights: &[f64], markets: &[Market]) -> BTreeMap<Market, f64> {
    let mut sums = BTreeMap::new();
    for (w, m) in weights.iter().zip(markets) {
        *sums.entry(*m).or_insert(0.0) += w;
    }
    sums
}

fn clip(weights: &mut [f64], cap: f64) {
    for w in weights.iter_mut() {
        *w = w.min(cap);
    }
}

/// Enforce per-strategy and per-market caps so weights sum to one.
///
/// Each round: clip strategies, scale overweight markets down to the market
/// cap and re-clip, then hand the missing weight to strategies with headroom
/// in under-cap markets, proportionally to their weight (uniformly if their
/// weight is zero). When no market has room the residual is spread uniformly
/// over every strategy. Stops early once the total is one and no market is
/// over; always ends with a hard renormalisation. Initial weights summing
/// above one are scaled down first.
pub fn enforce_caps(
    initial: &[f64],
    markets: &[Market],
    strategy_cap: f64,
    market_cap: f64,
    max_iterations: usize,
) -> Result<CapOutcome, PortfolioError> {
    if initial.len() != markets.len() {
        return Err(PortfolioError::LengthMismatch {
            weights: initial.len(),
            markets: markets.len(),
        });
    }
    for (field, value) in [("strategy", strategy_cap), ("market", market_cap)] {
        if !(value > 0.0 && value <= 1.0) {
            return Err(PortfolioError::InvalidCap { field, value });
        }
    }
    if initial.is_empty() {
        return Ok(CapOutcome {
            weights: Vec::new(),
            converged: true,
            iterations: 0,
            residual_violation: 0.0,
        });
    }

    let mut w: Vec<f64> = initial.iter().map(|x| x.max(0.0)).collect();
    // Rounds only ever add a non-negative residual.
    let start_total: f64 = w.iter().sum();
    if start_total > 1.0 {
        for x in w.iter_mut() {
            *x /= start_total;
        }
    }
    let mut converged = false;
    let mut iterations = 0;

    for round in 1..=max_iterations {
        iterations = round;
        clip(&mut w, strategy_cap);

        let sums = market_sums(&w, markets);
        for (wi, m) in w.iter_mut().zip(markets) {
            let s = sums[m];
            if s > market_cap {
                *wi *= market_cap / s;
            }
        }
        clip(&mut w, strategy_cap);

        let sums = market_sums(&w, markets);
        let residual = 1.0 - w.iter().sum::<f64>();
        let over = sums.values().any(|&s| s > market_cap + CAP_TOLERANCE);
        if residual.abs() <= CAP_TOLERANCE && !over {
            converged = true;
            break;
        }

        let under: Vec<bool> = markets
            .iter()
            .map(|m| sums[m] < market_cap - CAP_TOLERANCE)
            .collect();
        let mut receivers: Vec<usize> = (0..w.len())
            .filter(|&i| under[i] && w[i] < strategy_cap - CAP_TOLERANCE)
            .collect();
        if receivers.is_empty() {
            receivers = (0..w.len()).filter(|&i| under[i]).collect();
        }
        let last_resort = receivers.is_empty();
        if last_resort {
            receivers = (0..w.len()).collect();
        }
        let pool: f64 = receivers.iter().map(|&i| w[i]).sum();
        for &i in &receivers {
            let share = if pool > 0.0 && !last_resort {
                w[i] / pool
            } else {
                1.0 / receivers.len() as f64
            };
            w[i] += residual * share;
        }
        clip(&mut w, strategy_cap);
    }

    let total: f64 = w.iter().sum();
    if total > 0.0 {
        for x in w.iter_mut() {
            *x /= total;
        }
    }

    let sums = market_sums(&w, markets);
    let residual_violation = w
        .iter()
        .map(|x| x - strategy_cap)
        .chain(sums.values().map(|s| s - market_cap))
        .fold(0.0_f64, f64::max);

    if !converged {
        warn!(
            iterations,
            residual_violation, "cap solver did not converge, weights renormalised"
        );
    }
    Ok(CapOutcome {
        weights: w,
        converged,
        iterations,
        residual_violation,
    })
}

// ─── Blending ────────────────────────────────────────────────────────

/// Weighted sum of normalised curves on their common timestamps, scaled to
/// `capital`.
pub fn blend_equity(curves: &[(&EquityCurve, f64)], capital: f64) -> EquityCurve {
    let normalized: Vec<(EquityCurve, f64)> =
        curves.iter().map(|(c, w)| (c.normalized(), *w)).collect();
    let Some((first, _)) = normalized.first() else {
        return EquityCurve::new();
    };

    let maps: Vec<BTreeMap<_, f64>> = normalized
        .iter()
        .map(|(c, _)| c.points().iter().map(|p| (p.time, p.equity)).collect())
        .collect();

    first
        .points()
        .iter()
        .filter_map(|p| {
            let mut value = 0.0;
            for (map, (_, w)) in maps.iter().zip(&normalized) {
                value += map.get(&p.time)? * w;
            }
            Some((p.time, value * capital))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub n_strategies: usize,
    pub avg_monthly_return: f64,
    pub worst_month: f64,
    pub max_drawdown: f64,
}

impl PortfolioMetrics {
    fn from_curve(curve: &EquityCurve, n_strategies: usize) -> Self {
        let m = SimMetrics::compute(curve, 0);
        Self {
            n_strategies,
            avg_monthly_return: m.avg_monthly_return.unwrap_or(0.0),
            worst_month: m.worst_month.unwrap_or(0.0),
            max_drawdown: max_drawdown(&curve.values()),
        }
    }
}

/// The persisted portfolio selection (`selection.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSelection {
    pub selected: Vec<String>,
    pub weights: BTreeMap<String, f64>,
    pub metrics: PortfolioMetrics,
}

impl PortfolioSelection {
    pub fn empty() -> Self {
        Self {
            selected: Vec::new(),
            weights: BTreeMap::new(),
            metrics: PortfolioMetrics {
                n_strategies: 0,
                avg_monthly_return: 0.0,
                worst_month: 0.0,
                max_drawdown: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortfolioOutcome {
    pub selection: PortfolioSelection,
    pub descriptors: Vec<StrategyDescriptor>,
    pub caps: Option<CapOutcome>,
    pub equity: EquityCurve,
}

/// Build the portfolio from accepted descriptors.
pub fn build_portfolio(
    data: &dyn MarketData,
    accepted: &[StrategyDescriptor],
    config: &PortfolioConfig,
    sim: &SimConfig,
) -> Result<PortfolioOutcome, PortfolioError> {
    let candidates = build_candidates(data, accepted, sim);
    let chosen = select_uncorrelated(&candidates, config.correlation_cap, config.max_strategies);
    if chosen.is_empty() {
        info!(candidates = candidates.len(), "no viable portfolio");
        return Ok(PortfolioOutcome {
            selection: PortfolioSelection::empty(),
            descriptors: Vec::new(),
            caps: None,
            equity: EquityCurve::new(),
        });
    }

    let daily: Vec<&[(NaiveDate, f64)]> = chosen
        .iter()
        .map(|&i| candidates[i].daily.as_slice())
        .collect();
    let markets: Vec<Market> = chosen
        .iter()
        .map(|&i| candidates[i].descriptor.market())
        .collect();
    let base = risk_parity_weights(&daily, config.max_weight_per_strategy);
    let caps = enforce_caps(
        &base,
        &markets,
        config.max_weight_per_strategy,
        config.max_weight_per_market,
        config.cap_iterations,
    )?;

    let curves: Vec<(&EquityCurve, f64)> = chosen
        .iter()
        .zip(&caps.weights)
        .map(|(&i, &w)| (&candidates[i].equity, w))
        .collect();
    let equity = blend_equity(&curves, sim.starting_capital);

    let selected: Vec<String> = chosen.iter().map(|&i| candidates[i].key.clone()).collect();
    let weights = selected.iter().cloned().zip(caps.weights.iter().copied()).collect();
    let metrics = PortfolioMetrics::from_curve(&equity, selected.len());
    info!(
        candidates = candidates.len(),
        selected = selected.len(),
        converged = caps.converged,
        "portfolio built"
    );

    Ok(PortfolioOutcome {
        descriptors: chosen.iter().map(|&i| candidates[i].descriptor.clone()).collect(),
        selection: PortfolioSelection {
            selected,
            weights,
            metrics,
        },
        caps: Some(caps),
        equity,
    })
}

/// Descriptors accepted by both the backtest and the forward stage, matched on
/// base key. The forward record wins.
pub fn intersect_accepted(
    backtest: &[StrategyDescriptor],
    forward: &[StrategyDescriptor],
) -> Vec<StrategyDescriptor> {
    let keys: HashSet<String> = backtest.iter().map(StrategyDescriptor::base_key).collect();
    forward
        .iter()
        .filter(|d| keys.contains(&d.base_key()))
        .cloned()
        .collect()
}

// ─── Validation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightViolation {
    pub key: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketViolation {
    pub market: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationViolation {
    pub a: String,
    pub b: String,
    pub correlation: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Violations {
    pub strategy_weights: Vec<WeightViolation>,
    pub market_caps: Vec<MarketViolation>,
    pub correlations: Vec<CorrelationViolation>,
}

/// Independent re-check of a persisted selection (`validation_report.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub sum_weights: f64,
    pub max_w_per_strategy: f64,
    pub max_w_per_market: f64,
    pub correlation_cap: f64,
    /// Effective number of bets, 1 / Σw².
    pub enb: f64,
    pub violations: Violations,
    pub passed: bool,
}

/// 1 / Σw², or 0 for no weight at all.
pub fn effective_number_of_bets(weights: &BTreeMap<String, f64>) -> f64 {
    let squares: f64 = weights.values().map(|w| w * w).sum();
    if squares > 0.0 {
        1.0 / squares
    } else {
        0.0
    }
}

/// Market segment of a strategy key (`BTCUSDT|f5|...` → `BTCUSDT`).
fn key_market(key: &str) -> &str {
    key.split('|').next().unwrap_or(key)
}

/// Check weights against the caps and pairwise daily-return correlations.
///
/// `daily` holds the return series of every key that could be re-simulated;
/// keys without one are left out of the correlation check.
pub fn check_portfolio(
    weights: &BTreeMap<String, f64>,
    daily: &BTreeMap<String, Vec<(NaiveDate, f64)>>,
    config: &PortfolioConfig,
) -> ValidationReport {
    let sum_weights: f64 = weights.values().sum();

    let strategy_weights: Vec<WeightViolation> = weights
        .iter()
        .filter(|(_, w)| **w > config.max_weight_per_strategy + CAP_TOLERANCE)
        .map(|(key, w)| WeightViolation {
            key: key.clone(),
            weight: *w,
        })
        .collect();

    let mut by_market: BTreeMap<&str, f64> = BTreeMap::new();
    for (key, w) in weights {
        *by_market.entry(key_market(key)).or_insert(0.0) += w;
    }
    let market_caps: Vec<MarketViolation> = by_market
        .into_iter()
        .filter(|(_, w)| *w > config.max_weight_per_market + CAP_TOLERANCE)
        .map(|(market, weight)| MarketViolation {
            market: market.to_string(),
            weight,
        })
        .collect();

    let series: Vec<(&String, &Vec<(NaiveDate, f64)>)> = daily.iter().collect();
    let mut correlations = Vec::new();
    for (i, (a, ra)) in series.iter().enumerate() {
        for (b, rb) in &series[i + 1..] {
            let cap = config.correlation_cap + CAP_TOLERANCE;
            if let Some(c) = correlation(ra, rb).filter(|c| *c > cap) {
                correlations.push(CorrelationViolation {
                    a: (*a).clone(),
                    b: (*b).clone(),
                    correlation: c,
                });
            }
        }
    }

    let violations = Violations {
        strategy_weights,
        market_caps,
        correlations,
    };
    let passed = (sum_weights - 1.0).abs() < 1e-6
        && violations.strategy_weights.is_empty()
        && violations.market_caps.is_empty()
        && violations.correlations.is_empty();

    ValidationReport {
        sum_weights,
        max_w_per_strategy: config.max_weight_per_strategy,
        max_w_per_market: config.max_weight_per_market,
        correlation_cap: config.correlation_cap,
        enb: effective_number_of_bets(weights),
        violations,
        passed,
    }
}

/// Re-simulate every weighted key over full history and check the selection.
pub fn validate_portfolio(
    data: &dyn MarketData,
    book: &DescriptorBook,
    weights: &BTreeMap<String, f64>,
    config: &PortfolioConfig,
    sim: &SimConfig,
) -> ValidationReport {
    let mut daily = BTreeMap::new();
    for key in weights.keys() {
        let Some(d) = book.resolve(key) else {
            warn!(%key, "cannot resolve descriptor, left out of correlation check");
            continue;
        };
        let Some(table) = data.table(d.market()) else {
            continue;
        };
        match run_backtest(table, &d, sim) {
            Ok(result) => {
                daily.insert(key.clone(), daily_returns(&result.equity));
            }
            Err(e) => warn!(%key, error = %e, "re-simulation failed"),
        }
    }
    let report = check_portfolio(weights, &daily, config);
    info!(
        passed = report.passed,
        sum = report.sum_weights,
        enb = report.enb,
        strategy_violations = report.violations.strategy_weights.len(),
        market_violations = report.violations.market_caps.len(),
        correlation_violations = report.violations.correlations.len(),
        "portfolio validated"
    );
    report
}

#[derive(Debug, Serialize)]
struct EquityRow {
    time: String,
    equity: f64,
}

/// Write `selection.json`, `selected_strategies.json` and
/// `portfolio_equity.csv` into `dir`.
pub fn write_portfolio_artifacts(dir: &Path, outcome: &PortfolioOutcome) -> Result<()> {
    write_json(&dir.join("selection.json"), &outcome.selection)?;
    save_descriptors(&dir.join("selected_strategies.json"), &outcome.descriptors)?;
    let rows: Vec<EquityRow> = outcome
        .equity
        .points()
        .iter()
        .map(|p| EquityRow {
            time: p.time.to_rfc3339(),
            equity: p.equity,
        })
        .collect();
    write_csv(&dir.join("portfolio_equity.csv"), &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn day(i: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(i)
    }

    fn series(values: &[f64]) -> Vec<(NaiveDate, f64)> {
        values.iter().enumerate().map(|(i, v)| (day(i as i64), *v)).collect()
    }

    fn candidate(symbol: &str, fast: i64, score: f64, daily: Vec<(NaiveDate, f64)>) -> Candidate {
        let descriptor = crate::test_support::descriptor_1m(symbol, fast, fast + 10);
        Candidate {
            key: descriptor.key(),
            descriptor,
            equity: EquityCurve::new(),
            daily,
            metrics: SimMetrics {
                trades: 0,
                net_return: 0.0,
                max_drawdown: 0.0,
                avg_monthly_return: None,
                worst_month: None,
            },
            score,
        }
    }

    #[test]
    fn score_penalises_drawdown() {
        let d = series(&[0.01, 0.01]);
        assert!((score(&d, -0.2) - (0.3 - 0.1)).abs() < 1e-12);
        assert!((score(&d, 0.0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn correlated_pair_keeps_only_the_better() {
        let base = [0.01, -0.02, 0.015, 0.003, -0.007, 0.02, -0.01];
        let noisy: Vec<f64> = base
            .iter()
            .enumerate()
            .map(|(i, v)| v + if i % 2 == 0 { 0.001 } else { -0.001 })
            .collect();
        let a = candidate("BTCUSDT", 3, 1.0, series(&base));
        let b = candidate("ETHUSDT", 4, 0.5, series(&noisy));
        assert!(correlation(&a.daily, &b.daily).unwrap() > 0.95);
        let chosen = select_uncorrelated(&[b, a], 0.60, 10);
        assert_eq!(chosen, vec![1]);
    }

    #[test]
    fn undefined_correlation_does_not_block() {
        let a = candidate("BTCUSDT", 3, 1.0, series(&[0.01, 0.02, -0.01]));
        let b = candidate("ETHUSDT", 4, 0.5, series(&[0.0, 0.0, 0.0]));
        assert_eq!(select_uncorrelated(&[a, b], 0.60, 10), vec![0, 1]);
    }

    #[test]
    fn selection_stops_at_max_size() {
        let cands: Vec<Candidate> = (0..5)
            .map(|i| candidate("SOLUSDT", 3 + i, i as f64, series(&[0.0])))
            .collect();
        assert_eq!(select_uncorrelated(&cands, 0.6, 2), vec![4, 3]);
    }

    #[test]
    fn inverse_volatility_favours_calm_series() {
        let calm = series(&[0.01, -0.01, 0.01, -0.01]);
        let wild = series(&[0.02, -0.02, 0.02, -0.02]);
        let flat = series(&[0.0, 0.0, 0.0, 0.0]);
        let w = risk_parity_weights(&[&calm, &wild, &flat], 1.0);
        assert!((w[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((w[1] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(w[2], 0.0);
    }

    #[test]
    fn caps_hold_on_feasible_input() {
        let markets = [
            Market::Btcusdt,
            Market::Btcusdt,
            Market::Btcusdt,
            Market::Ethusdt,
            Market::Solusdt,
        ];
        let initial = [0.4, 0.3, 0.2, 0.05, 0.05];
        let out = enforce_caps(&initial, &markets, 0.4, 0.6, 20).unwrap();
        assert!(out.converged);
        assert!((out.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        let sums = market_sums(&out.weights, &markets);
        assert!(sums.values().all(|&s| s <= 0.6 + 1e-9));
        assert!(out.weights.iter().all(|&w| w <= 0.4 + 1e-9));
        assert!(out.residual_violation <= 1e-9);
    }

    #[test]
    fn infeasible_caps_report_non_convergence() {
        let out = enforce_caps(&[1.0], &[Market::Btcusdt], 0.4, 0.6, 20).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 20);
        assert!((out.weights[0] - 1.0).abs() < 1e-12);
        assert!((out.residual_violation - 0.6).abs() < 1e-9);
    }

    #[test]
    fn full_markets_spread_the_residual_uniformly() {
        let markets = [Market::Btcusdt, Market::Btcusdt];
        let out = enforce_caps(&[0.4, 0.2], &markets, 0.4, 0.6, 1).unwrap();
        assert!(!out.converged);
        assert!((out.weights[0] - 0.5).abs() < 1e-12, "{:?}", out.weights);
        assert!((out.weights[1] - 0.5).abs() < 1e-12, "{:?}", out.weights);
    }

    #[test]
    fn zero_weights_are_filled_uniformly() {
        let markets = [Market::Btcusdt, Market::Ethusdt, Market::Solusdt];
        let out = enforce_caps(&[0.0, 0.0, 0.0], &markets, 0.4, 0.6, 20).unwrap();
        assert!(out.converged);
        for w in &out.weights {
            assert!((w - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn cap_inputs_are_validated() {
        assert!(matches!(
            enforce_caps(&[0.5], &[], 0.4, 0.6, 20),
            Err(PortfolioError::LengthMismatch { .. })
        ));
        assert!(matches!(
            enforce_caps(&[0.5], &[Market::Btcusdt], 0.0, 0.6, 20),
            Err(PortfolioError::InvalidCap { field: "strategy", .. })
        ));
    }

    #[test]
    fn blend_uses_common_timestamps() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a: EquityCurve = (0..4)
            .map(|i| (t0 + Duration::days(i), 100.0 + 10.0 * i as f64))
            .collect();
        let b: EquityCurve = (1..5).map(|i| (t0 + Duration::days(i), 50.0)).collect();
        let blended = blend_equity(&[(&a, 0.5), (&b, 0.5)], 1000.0);
        assert_eq!(blended.len(), 3);
        let first = blended.points()[0];
        assert_eq!(first.time, t0 + Duration::days(1));
        assert!((first.equity - 1000.0 * (0.5 * 1.1 + 0.5 * 1.0)).abs() < 1e-9);
    }

    #[test]
    fn intersection_matches_on_base_key() {
        let a = crate::test_support::descriptor_1m("BTCUSDT", 3, 5);
        let a15 = a.with_timeframe(perplab_core::domain::Timeframe::M15);
        let b = crate::test_support::descriptor_1m("ETHUSDT", 3, 5);
        let out = intersect_accepted(&[a], &[a15.clone(), b]);
        assert_eq!(out, vec![a15]);
    }
    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, w)| (k.to_string(), *w)).collect()
    }

    #[test]
    fn enb_of_equal_weights_is_their_count() {
        let w = weights(&[("A", 0.25), ("B", 0.25), ("C", 0.25), ("D", 0.25)]);
        assert!((effective_number_of_bets(&w) - 4.0).abs() < 1e-12);
        assert_eq!(effective_number_of_bets(&BTreeMap::new()), 0.0);
    }

    #[test]
    fn check_flags_every_kind_of_violation() {
        let config = PortfolioConfig::default();
        let w = weights(&[
            ("BTCUSDT|f3|s13|sl0.0200|1m", 0.45),
            ("BTCUSDT|f4|s14|sl0.0200|1m", 0.25),
            ("ETHUSDT|f3|s13|sl0.0200|1m", 0.30),
        ]);
        let up = series(&[0.01, -0.02, 0.03, 0.00, 0.01]);
        let daily = BTreeMap::from([
            ("BTCUSDT|f3|s13|sl0.0200|1m".to_string(), up.clone()),
            ("ETHUSDT|f3|s13|sl0.0200|1m".to_string(), up),
        ]);
        let report = check_portfolio(&w, &daily, &config);

        assert!(!report.passed);
        assert!((report.sum_weights - 1.0).abs() < 1e-12);
        assert_eq!(report.violations.strategy_weights.len(), 1);
        assert_eq!(report.violations.strategy_weights[0].weight, 0.45);
        assert_eq!(report.violations.market_caps.len(), 1);
        assert_eq!(report.violations.market_caps[0].market, "BTCUSDT");
        assert_eq!(report.violations.correlations.len(), 1);
        assert!((report.violations.correlations[0].correlation - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clean_selection_passes() {
        let config = PortfolioConfig::default();
        let w = weights(&[
            ("BTCUSDT|f3|s13|sl0.0200|1m", 0.4),
            ("ETHUSDT|f3|s13|sl0.0200|1m", 0.3),
            ("SOLUSDT|f3|s13|sl0.0200|1m", 0.3),
        ]);
        let daily = BTreeMap::from([
            (
                "BTCUSDT|f3|s13|sl0.0200|1m".to_string(),
                series(&[0.01, -0.01, 0.01, -0.01]),
            ),
            (
                "ETHUSDT|f3|s13|sl0.0200|1m".to_string(),
                series(&[-0.01, 0.01, -0.01, 0.01]),
            ),
        ]);
        let report = check_portfolio(&w, &daily, &config);
        assert!(report.passed, "{report:?}");
        assert!((report.enb - 1.0 / 0.34).abs() < 1e-9);
    }
}
