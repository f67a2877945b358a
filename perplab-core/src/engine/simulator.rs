//! Bar-by-bar backtest simulator for one descriptor.
//!
//! Per bar, in order:
//! 1. Exits: stop breach fills at the stop, otherwise an opposite crossover
//!    closes at the bar close. Slippage always works against the holder.
//! 2. Entries (flat only, direction permitting) at the close with slippage,
//!    sized by risk and capped by leverage. Entry fee is charged at once.
//! 3. Funding: an open position pays (long) or receives (short) qty × close × rate.
//! 4. Equity (realized, cash-like) is recorded.
//!
//! Equity is never floored; a pathological descriptor can drive it negative.

use thiserror::Error;

use super::sizing::position_notional;
use crate::data::PriceTable;
use crate::domain::{
    Bar, EquityCurve, ExitReason, OpenPosition, PositionState, Side, SimEvent, SimEventKind,
    StrategyDescriptor, Trade,
};
use crate::metrics::SimMetrics;
use crate::signals::{crossover_signals, SignalSeries};

// ─── Configuration ───────────────────────────────────────────────────

/// Account-level inputs to a simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimConfig {
    pub starting_capital: f64,
    pub max_leverage: f64,
    /// Extended mode: record every entry/exit/funding event.
    pub record_events: bool,
}

impl SimConfig {
    pub fn new(starting_capital: f64, max_leverage: f64) -> Self {
        Self {
            starting_capital,
            max_leverage,
            record_events: false,
        }
    }

    pub fn with_events(mut self) -> Self {
        self.record_events = true;
        self
    }
}

// ─── Result types ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimResult {
    pub metrics: SimMetrics,
    pub equity: EquityCurve,
    pub trades: Vec<Trade>,
    /// Empty unless `record_events` was set.
    pub events: Vec<SimEvent>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("starting capital must be positive and finite, got {0}")]
    InvalidCapital(f64),
    #[error("max leverage must be positive and finite, got {0}")]
    InvalidLeverage(f64),
}

// ─── Simulation ──────────────────────────────────────────────────────

struct Account<'a> {
    descriptor: &'a StrategyDescriptor,
    config: SimConfig,
    equity: f64,
    state: PositionState,
    entry_fee: f64,
    entries: usize,
    trades: Vec<Trade>,
    events: Vec<SimEvent>,
}

impl<'a> Account<'a> {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        bar: &Bar,
        kind: SimEventKind,
        side: Side,
        price: f64,
        qty: f64,
        fee: f64,
        pnl: f64,
    ) {
        if self.config.record_events {
            self.events.push(SimEvent {
                time: bar.time,
                kind,
                side,
                price,
                quantity: qty,
                fee,
                pnl,
                equity_after: self.equity,
            });
        }
    }

    fn close(&mut self, bar: &Bar, raw_price: f64, reason: ExitReason) {
        let Some((side, pos)) = self.state.take() else {
            return;
        };
        let d = self.descriptor;
        let exit = side.exit_fill(raw_price, d.slippage());
        let qty = pos.quantity();
        let gross = side.pnl(pos.entry_price(), exit, qty);
        let fee = pos.notional(exit) * d.fee_rate();
        self.equity += gross - fee;

        let fees = self.entry_fee + fee;
        self.trades.push(Trade {
            side,
            entry_time: pos.opened_at(),
            entry_price: pos.entry_price(),
            exit_time: bar.time,
            exit_price: exit,
            quantity: qty,
            gross_pnl: gross,
            fees,
            funding: pos.funding_accrued(),
            net_pnl: gross - fees + pos.funding_accrued(),
            exit_reason: reason,
        });
        let kind = match reason {
            ExitReason::Stop => SimEventKind::ExitStop,
            ExitReason::Reversal => SimEventKind::ExitReversal,
        };
        self.record(bar, kind, side, exit, qty, fee, gross);
        self.entry_fee = 0.0;
    }

    fn check_exit(&mut self, bar: &Bar, i: usize, signals: &SignalSeries) {
        let Some((side, stop)) = self
            .state
            .side()
            .zip(self.state.position().map(OpenPosition::stop_price))
        else {
            return;
        };
        if side.stop_breached(stop, bar.high, bar.low) {
            self.close(bar, stop, ExitReason::Stop);
            return;
        }
        let opposite = match side {
            Side::Long => signals.short_entry[i],
            Side::Short => signals.long_entry[i],
        };
        if opposite {
            self.close(bar, bar.close, ExitReason::Reversal);
        }
    }

    fn try_enter(&mut self, bar: &Bar, i: usize, signals: &SignalSeries) {
        let d = self.descriptor;
        let side = if signals.long_entry[i] && d.direction().allows(Side::Long) {
            Side::Long
        } else if signals.short_entry[i] && d.direction().allows(Side::Short) {
            Side::Short
        } else {
            return;
        };

        let entry = side.entry_fill(bar.close, d.slippage());
        let stop = side.stop_from(entry, d.stop_loss_pct());
        let risk = self.equity * d.risk_fraction();
        let leverage_cap = self.equity * self.config.max_leverage;
        let Some(notional) = position_notional(risk, entry, stop, leverage_cap, None) else {
            return;
        };
        let Some(pos) = OpenPosition::new(notional / entry, entry, stop, bar.time) else {
            return;
        };

        let fee = notional * d.fee_rate();
        self.equity -= fee;
        self.entry_fee = fee;
        self.entries += 1;
        let qty = pos.quantity();
        self.state = PositionState::open(side, pos);
        self.record(bar, SimEventKind::Entry, side, entry, qty, fee, 0.0);
    }

    fn settle_funding(&mut self, bar: &Bar) {
        let Some(rate) = bar.funding else {
            return;
        };
        let Some(side) = self.state.side() else {
            return;
        };
        let Some(pos) = self.state.position_mut() else {
            return;
        };
        let qty = pos.quantity();
        let flow = -side.sign() * qty * bar.close * rate;
        pos.accrue_funding(flow);
        self.equity += flow;
        self.record(bar, SimEventKind::Funding, side, bar.close, qty, 0.0, flow);
    }
}

/// Simulate `descriptor` over `table` (native granularity; resampled here).
pub fn run_backtest(
    table: &PriceTable,
    descriptor: &StrategyDescriptor,
    config: &SimConfig,
) -> Result<SimResult, SimError> {
    if !(config.starting_capital.is_finite() && config.starting_capital > 0.0) {
        return Err(SimError::InvalidCapital(config.starting_capital));
    }
    if !(config.max_leverage.is_finite() && config.max_leverage > 0.0) {
        return Err(SimError::InvalidLeverage(config.max_leverage));
    }

    let resampled = table.resample(descriptor.timeframe());
    let bars = resampled.bars();
    let signals = crossover_signals(bars, descriptor);

    let mut account = Account {
        descriptor,
        config: *config,
        equity: config.starting_capital,
        state: PositionState::Flat,
        entry_fee: 0.0,
        entries: 0,
        trades: Vec::new(),
        events: Vec::new(),
    };
    let mut equity = EquityCurve::with_capacity(bars.len());

    for (i, bar) in bars.iter().enumerate() {
        account.check_exit(bar, i, &signals);
        if account.state.is_flat() {
            account.try_enter(bar, i, &signals);
        }
        account.settle_funding(bar);
        equity.push(bar.time, account.equity);
    }

    Ok(SimResult {
        metrics: SimMetrics::compute(&equity, account.entries),
        equity,
        trades: account.trades,
        events: account.events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawDescriptor;
    use crate::indicators::make_bars;

    fn descriptor(raw_edit: impl FnOnce(&mut RawDescriptor)) -> StrategyDescriptor {
        let mut raw = RawDescriptor::new("BTCUSDT", 3, 5, 0.02, 0.01);
        raw.timeframe = "1m".into();
        raw_edit(&mut raw);
        StrategyDescriptor::try_from(raw).unwrap()
    }

    fn rise_then_fall() -> Vec<f64> {
        let mut closes = vec![100.0; 6];
        closes.extend((1..=8).map(|i| 100.0 + i as f64));
        closes.extend((1..=10).map(|i| 108.0 - 2.0 * i as f64));
        closes
    }

    #[test]
    fn rejects_bad_account_inputs() {
        let table = PriceTable::new(make_bars(&[1.0, 2.0])).unwrap();
        let d = descriptor(|_| {});
        assert_eq!(
            run_backtest(&table, &d, &SimConfig::new(0.0, 3.0)).unwrap_err(),
            SimError::InvalidCapital(0.0)
        );
        assert!(run_backtest(&table, &d, &SimConfig::new(1000.0, -1.0)).is_err());
    }

    #[test]
    fn warmup_only_series_has_no_trades() {
        let table = PriceTable::new(make_bars(&[100.0, 101.0, 102.0, 103.0])).unwrap();
        let r = run_backtest(&table, &descriptor(|_| {}), &SimConfig::new(10_000.0, 3.0)).unwrap();
        assert_eq!(r.metrics.trades, 0);
        assert!(r.equity.values().iter().all(|&e| e == 10_000.0));
    }

    #[test]
    fn entry_fee_is_charged_on_entry_bar() {
        let table = PriceTable::new(make_bars(&rise_then_fall())).unwrap();
        let config = SimConfig::new(10_000.0, 3.0).with_events();
        let r = run_backtest(&table, &descriptor(|_| {}), &config).unwrap();
        let entry = r
            .events
            .iter()
            .find(|e| e.kind == SimEventKind::Entry)
            .unwrap();
        assert!(entry.fee > 0.0);
        assert!((entry.equity_after - (10_000.0 - entry.fee)).abs() < 1e-9);
        assert!((entry.fee - entry.price * entry.quantity * 0.0004).abs() < 1e-9);
    }

    #[test]
    fn long_only_never_shorts() {
        let table = PriceTable::new(make_bars(&rise_then_fall())).unwrap();
        let d = descriptor(|r| r.direction = "long".into());
        let r = run_backtest(&table, &d, &SimConfig::new(10_000.0, 3.0)).unwrap();
        assert!(r.trades.iter().all(|t| t.side == Side::Long));
    }

    #[test]
    fn funding_is_paid_by_longs() {
        let mut bars = make_bars(&rise_then_fall());
        for b in bars.iter_mut() {
            b.funding = Some(0.001);
        }
        let table = PriceTable::new(bars).unwrap();
        let d = descriptor(|r| r.direction = "long".into());
        let r = run_backtest(&table, &d, &SimConfig::new(10_000.0, 3.0).with_events()).unwrap();
        let funding: Vec<_> = r
            .events
            .iter()
            .filter(|e| e.kind == SimEventKind::Funding)
            .collect();
        assert!(!funding.is_empty());
        assert!(funding.iter().all(|e| e.pnl < 0.0));
        assert!(r.trades[0].funding < 0.0);
    }

    #[test]
    fn shorts_receive_positive_funding() {
        let mut closes = vec![100.0; 6];
        closes.extend((1..=10).map(|i| 100.0 - i as f64));
        let mut bars = make_bars(&closes);
        for b in bars.iter_mut() {
            b.funding = Some(0.001);
        }
        let table = PriceTable::new(bars).unwrap();
        let d = descriptor(|r| {
            r.direction = "short".into();
            r.stop_loss_pct = 0.5;
        });
        let r = run_backtest(&table, &d, &SimConfig::new(10_000.0, 3.0).with_events()).unwrap();
        let funding_total: f64 = r
            .events
            .iter()
            .filter(|e| e.kind == SimEventKind::Funding)
            .map(|e| e.pnl)
            .sum();
        assert!(funding_total > 0.0);
    }

    #[test]
    fn stop_breach_fills_at_stop_with_slippage() {
        // Enter long on the crossover, then crash through the 2% stop.
        let mut closes = vec![100.0; 6];
        closes.push(101.0);
        closes.push(80.0);
        let table = PriceTable::new(make_bars(&closes)).unwrap();
        let d = descriptor(|_| {});
        let r = run_backtest(&table, &d, &SimConfig::new(10_000.0, 3.0)).unwrap();
        assert_eq!(r.trades.len(), 1);
        let t = &r.trades[0];
        assert_eq!(t.exit_reason, ExitReason::Stop);
        let stop = t.entry_price * (1.0 - 0.02);
        assert!((t.exit_price - stop * (1.0 - 0.0002)).abs() < 1e-9);
    }

    #[test]
    fn five_minute_timeframe_resamples_before_signals() {
        let closes: Vec<f64> = (0..300).map(|i| 100.0 + (i as f64 * 0.05).sin() * 5.0).collect();
        let table = PriceTable::new(make_bars(&closes)).unwrap();
        let d = descriptor(|r| r.timeframe = "5m".into());
        let r = run_backtest(&table, &d, &SimConfig::new(10_000.0, 3.0)).unwrap();
        assert_eq!(r.equity.len(), 60);
        assert_eq!(r.equity.first(), Some(10_000.0));
    }
}
