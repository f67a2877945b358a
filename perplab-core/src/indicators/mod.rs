//! Indicators used by the crossover signal and its filters.
//!
//! Indicators are pure functions: bar history in, numeric series out, one
//! value per bar with `f64::NAN` during warmup. No value at bar t depends on
//! bars after t.

pub mod atr;
pub mod sma;

pub use atr::{true_range, Atr};
pub use sma::Sma;

use crate::domain::Bar;

/// Trait for indicators.
pub trait Indicator {
    /// Human-readable name (e.g., "sma_20", "atr_14").
    fn name(&self) -> &str;

    /// Number of leading NaN values in the output.
    fn lookback(&self) -> usize;

    /// Compute the indicator over the full bar series.
    fn compute(&self, bars: &[Bar]) -> Vec<f64>;
}

/// Trailing simple mean of `values` over `period`, NaN until the window is
/// full or while a NaN sits inside it.
pub(crate) fn rolling_mean(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let mut sum = 0.0;
    let mut nans = 0usize;
    for i in 0..n {
        let entering = values[i];
        if entering.is_nan() {
            nans += 1;
        } else {
            sum += entering;
        }
        if i >= period {
            let leaving = values[i - period];
            if leaving.is_nan() {
                nans -= 1;
            } else {
                sum -= leaving;
            }
        }
        if i + 1 >= period && nans == 0 {
            out[i] = sum / period as f64;
        }
    }
    out
}

/// Create synthetic minute bars from close prices for testing.
///
/// open = prev close (or close for the first bar), high/low = max/min of
/// open and close widened by 1.0.
#[cfg(test)]
pub fn make_bars(closes: &[f64]) -> Vec<Bar> {
    use chrono::{Duration, TimeZone, Utc};
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Bar {
                time: t0 + Duration::minutes(i as i64),
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: 1.0,
                funding: None,
            }
        })
        .collect()
}

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;
