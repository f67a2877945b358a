//! MA crossover entry signals with optional trend and volatility filters.
//!
//! A long entry fires at bar t when fast[t-1] <= slow[t-1] and
//! fast[t] > slow[t]; short is the mirror image. Comparisons involving an
//! undefined average are false, so nothing fires during warmup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::PriceTable;
use crate::domain::{Bar, Market, Side, StrategyDescriptor, Timeframe};
use crate::indicators::{Atr, Indicator, Sma};

/// Entry action as written to the signal feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    EntryLong,
    EntryShort,
}

impl SignalAction {
    pub fn side(&self) -> Side {
        match self {
            SignalAction::EntryLong => Side::Long,
            SignalAction::EntryShort => Side::Short,
        }
    }

    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Long => SignalAction::EntryLong,
            Side::Short => SignalAction::EntryShort,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::EntryLong => "entry_long",
            SignalAction::EntryShort => "entry_short",
        }
    }
}

/// Per-bar averages and filtered entry flags for one descriptor.
#[derive(Debug, Clone)]
pub struct SignalSeries {
    pub fast: Vec<f64>,
    pub slow: Vec<f64>,
    pub long_entry: Vec<bool>,
    pub short_entry: Vec<bool>,
}

impl SignalSeries {
    /// Filtered entry side at bar `i`, if any. Long wins a (degenerate) tie.
    pub fn entry_at(&self, i: usize) -> Option<Side> {
        if self.long_entry[i] {
            Some(Side::Long)
        } else if self.short_entry[i] {
            Some(Side::Short)
        } else {
            None
        }
    }
}

/// Compute crossover signals over `bars` (already at the descriptor timeframe).
///
/// Direction is not applied here; the simulator uses opposite signals as
/// reversal exits even when that side may not be entered.
pub fn crossover_signals(bars: &[Bar], descriptor: &StrategyDescriptor) -> SignalSeries {
    let n = bars.len();
    let fast = Sma::new(descriptor.fast()).compute(bars);
    let slow = Sma::new(descriptor.slow()).compute(bars);

    let vol_ok: Vec<bool> = if descriptor.atr_thresh() > 0.0 {
        let atr = Atr::new(descriptor.atr_period()).compute(bars);
        bars.iter()
            .zip(&atr)
            .map(|(b, a)| a / b.close >= descriptor.atr_thresh())
            .collect()
    } else {
        vec![true; n]
    };

    let tol = descriptor.trend_tol();
    let mut long_entry = vec![false; n];
    let mut short_entry = vec![false; n];
    for i in 1..n {
        let (f0, s0, f1, s1) = (fast[i - 1], slow[i - 1], fast[i], slow[i]);
        let cross_up = f0 <= s0 && f1 > s1;
        let cross_down = f0 >= s0 && f1 < s1;
        let (trend_long, trend_short) = if tol > 0.0 {
            let delta = (f1 - s1) / s1;
            (delta >= tol, -delta >= tol)
        } else {
            (true, true)
        };
        long_entry[i] = cross_up && trend_long && vol_ok[i];
        short_entry[i] = cross_down && trend_short && vol_ok[i];
    }

    SignalSeries {
        fast,
        slow,
        long_entry,
        short_entry,
    }
}

/// An entry signal detected on recent bars, ready for the signal feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub time: DateTime<Utc>,
    pub symbol: Market,
    pub timeframe: Timeframe,
    pub action: SignalAction,
    pub price: f64,
    pub stop_price: f64,
    pub strategy_key: String,
}

/// Entry signals on the last `lookback_bars` resampled bars, oldest first.
///
/// Direction restrictions apply here. The signal price is the raw close and
/// the stop is placed `stop_loss_pct` away from it. Tables shorter than the
/// slow window plus two bars produce nothing.
pub fn recent_entry_signals(
    table: &PriceTable,
    descriptor: &StrategyDescriptor,
    lookback_bars: usize,
) -> Vec<EntrySignal> {
    let tf = table.resample(descriptor.timeframe());
    let bars = tf.bars();
    if bars.len() < descriptor.slow() + 2 {
        return Vec::new();
    }
    let series = crossover_signals(bars, descriptor);
    let start = bars.len().saturating_sub(lookback_bars.max(1));

    (start..bars.len())
        .filter_map(|i| {
            let side = series.entry_at(i)?;
            if !descriptor.direction().allows(side) {
                return None;
            }
            let price = bars[i].close;
            Some(EntrySignal {
                time: bars[i].time,
                symbol: descriptor.market(),
                timeframe: descriptor.timeframe(),
                action: SignalAction::from_side(side),
                price,
                stop_price: side.stop_from(price, descriptor.stop_loss_pct()),
                strategy_key: descriptor.key(),
            })
        })
        .collect()
}
