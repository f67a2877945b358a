//! Paper execution router.
//!
//! A file-persisted state machine that turns entry signals into paper
//! positions, replays fresh bars against their stops, and enforces a daily
//! loss limit with a kill-switch marker. Every mutation is flushed to the
//! state file before the next one starts, and every signal id is processed
//! at most once.
//!
//! Per-call order:
//! 1. Day rollover when the UTC date changed.
//! 2. The operation itself (stops, signals, close-all).
//! 3. Daily loss check where the operation calls for it.

pub mod book;
pub mod clock;
pub mod feed;
pub mod ledger;
pub mod state;
pub mod store;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use perplab_core::domain::{OpenPosition, StrategyDescriptor};
use perplab_core::engine::position_notional;
use perplab_core::signals::EntrySignal;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use book::DescriptorBook;
pub use clock::{Clock, ManualClock, SystemClock};
pub use feed::SignalFeed;
pub use ledger::{LedgerEntry, LedgerEvent, OrderLedger};
pub use state::{RouterState, SignalId, TrackedPosition};
pub use store::{LoadStatus, StateLoad, StateStore};

use crate::config::PipelineConfig;
use crate::market_data::MarketData;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router state is locked by another process ({path}); remove the lock if no router is running")]
    Locked { path: PathBuf },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

// ─── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    pub starting_capital: f64,
    pub max_leverage: f64,
    /// Absolute notional ceiling; 0 disables it.
    pub max_notional: f64,
    pub daily_loss_limit_pct: f64,
    pub use_portfolio_weights: bool,
    pub killswitch_path: PathBuf,
}

impl RouterSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            starting_capital: config.risk.starting_capital,
            max_leverage: config.risk.max_leverage,
            max_notional: config.live.max_notional,
            daily_loss_limit_pct: config.live.daily_loss_limit_pct,
            use_portfolio_weights: config.live.use_portfolio_weights,
            killswitch_path: config.live.killswitch_path.clone(),
        }
    }
}

/// Presence of the marker file blocks new entries.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    path: PathBuf,
}

impl KillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.path.exists()
    }

    pub fn trip(&self) -> Result<(), RouterError> {
        let io = |source| RouterError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io)?;
        }
        fs::write(&self.path, "KILL").map_err(io)
    }
}

// ─── Reports ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub checked: usize,
    pub stopped: usize,
    pub killswitch: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalReport {
    pub pending: usize,
    pub opened: usize,
    pub flipped: usize,
    pub tightened: usize,
    pub skipped: usize,
    /// Pending signals marked processed without action (kill-switch or limit).
    pub blocked: usize,
}

// ─── Router ──────────────────────────────────────────────────────────

pub struct Router<C: Clock = SystemClock> {
    settings: RouterSettings,
    store: StateStore,
    ledger: OrderLedger,
    killswitch: KillSwitch,
    book: DescriptorBook,
    weights: BTreeMap<String, f64>,
    clock: C,
    state: RouterState,
    load_status: LoadStatus,
}

impl<C: Clock> Router<C> {
    /// Open the router rooted at `live_dir` (`state.json`, `orders_log.csv`).
    ///
    /// Fails with [`RouterError::Locked`] while another router holds the
    /// state. Absent state starts fresh; unreadable state is moved aside and
    /// restarted, which `load_status` reports as `Recovered`.
    pub fn open(
        live_dir: &Path,
        settings: RouterSettings,
        book: DescriptorBook,
        weights: BTreeMap<String, f64>,
        clock: C,
    ) -> Result<Self, RouterError> {
        let store = StateStore::open(&live_dir.join("state.json"))?;
        let load = store.load()?;
        let load_status = load.status();
        let state = match load {
            StateLoad::Loaded(state) => state,
            StateLoad::Fresh | StateLoad::Recovered { .. } => {
                RouterState::fresh(settings.starting_capital, clock.now().date_naive())
            }
        };
        info!(
            state = %store.path().display(),
            status = ?load_status,
            equity = state.equity,
            positions = state.positions.len(),
            "router opened"
        );

        let mut router = Self {
            killswitch: KillSwitch::new(settings.killswitch_path.clone()),
            ledger: OrderLedger::new(live_dir.join("orders_log.csv")),
            settings,
            store,
            book,
            weights,
            clock,
            state,
            load_status,
        };
        router.persist()?;
        router.rollover_if_needed()?;
        Ok(router)
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    pub fn load_status(&self) -> LoadStatus {
        self.load_status
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn killswitch(&self) -> &KillSwitch {
        &self.killswitch
    }

    fn persist(&self) -> Result<(), RouterError> {
        self.store.save(&self.state)
    }

    fn log(&self, entry: LedgerEntry) -> Result<(), RouterError> {
        self.ledger.append(&entry)
    }

    /// Reset the daily counters when the UTC date moved on.
    fn rollover_if_needed(&mut self) -> Result<(), RouterError> {
        let now = self.clock.now();
        let today = now.date_naive();
        if self.state.day_tag == today {
            return Ok(());
        }
        info!(from = %self.state.day_tag, to = %today, equity = self.state.equity, "day rollover");
        self.state.day_tag = today;
        self.state.day_start_equity = self.state.equity;
        self.state.realized_today = 0.0;
        self.log(LedgerEntry::account(
            now,
            LedgerEvent::DayRollover,
            self.state.equity,
            "NEW_DAY",
        ))?;
        self.persist()
    }

    /// Latest resampled close for `descriptor`'s market and timeframe.
    fn last_close(data: &dyn MarketData, descriptor: &StrategyDescriptor) -> Option<f64> {
        let table = data.table(descriptor.market())?;
        table.resample(descriptor.timeframe()).last_close()
    }

    // ─── Stops ───────────────────────────────────────────────────────

    /// Replay bars newer than each position's watermark against its stop,
    /// then evaluate the daily loss limit.
    pub fn update_stops(&mut self, data: &dyn MarketData) -> Result<StopReport, RouterError> {
        self.rollover_if_needed()?;
        let mut report = StopReport::default();

        let keys: Vec<String> = self.state.positions.keys().cloned().collect();
        for key in keys {
            let Some(descriptor) = self.book.resolve(&key) else {
                debug!(%key, "no descriptor for open position");
                continue;
            };
            let Some(table) = data.table(descriptor.market()) else {
                continue;
            };
            let Some(tracked) = self.state.positions.get(&key) else {
                continue;
            };
            report.checked += 1;

            let side = tracked.direction;
            let stop = tracked.position.stop_price();
            let watermark = tracked.watermark();
            let resampled = table.resample(descriptor.timeframe());

            let mut breach = None;
            let mut examined = None;
            for bar in resampled.bars().iter().filter(|b| b.time > watermark) {
                if side.stop_breached(stop, bar.high, bar.low) {
                    breach = Some(bar.time);
                    break;
                }
                examined = Some(bar.time);
            }

            if let Some(time) = breach {
                let Some(closed) = self.state.positions.remove(&key) else {
                    continue;
                };
                let pos = closed.position;
                let exit = side.exit_fill(stop, descriptor.slippage());
                let pnl = side.pnl(pos.entry_price(), exit, pos.quantity());
                let fee = pos.notional(exit) * descriptor.fee_rate();
                self.state.realize(pnl - fee);
                info!(%key, %side, exit, pnl, "stop hit");
                self.log(LedgerEntry::fill(
                    time,
                    &key,
                    Some(&descriptor),
                    LedgerEvent::CloseStop,
                    side,
                    exit,
                    pos.quantity(),
                    fee,
                    pnl,
                    self.state.equity,
                    "STOP",
                ))?;
                self.persist()?;
                report.stopped += 1;
            } else if let (Some(time), Some(tracked)) =
                (examined, self.state.positions.get_mut(&key))
            {
                tracked.last_checked = Some(time);
            }
        }
        self.persist()?;

        report.killswitch = self.check_daily_limit(data)?;
        Ok(report)
    }

    // ─── Signals ─────────────────────────────────────────────────────

    /// Risk budget for a new position on `key`.
    fn risk_amount(&self, key: &str, descriptor: &StrategyDescriptor) -> f64 {
        let mut risk = self.state.equity * descriptor.risk_fraction();
        if self.settings.use_portfolio_weights {
            if let Some(w) = self.weights.get(key) {
                risk *= w;
            }
        }
        risk
    }

    /// Process a batch of entry signals. Already-processed ids are ignored.
    pub fn process_signals(
        &mut self,
        signals: &[EntrySignal],
        data: &dyn MarketData,
    ) -> Result<SignalReport, RouterError> {
        self.rollover_if_needed()?;
        let mut report = SignalReport::default();

        let mut pending: Vec<&EntrySignal> = Vec::new();
        let mut batch_ids = std::collections::BTreeSet::new();
        for s in signals {
            let id = SignalId::from(s);
            if !self.state.processed_signals.contains(&id) && batch_ids.insert(id) {
                pending.push(s);
            }
        }
        report.pending = pending.len();
        if pending.is_empty() {
            debug!("no unprocessed signals");
            return Ok(report);
        }

        if self.killswitch.is_active() || self.check_daily_limit(data)? {
            warn!(
                pending = pending.len(),
                "kill-switch active or daily limit hit, no new entries"
            );
            self.state
                .processed_signals
                .extend(pending.iter().map(|s| SignalId::from(*s)));
            report.blocked = pending.len();
            self.persist()?;
            return Ok(report);
        }

        for signal in pending {
            self.state.processed_signals.insert(SignalId::from(signal));
            self.apply_signal(signal, &mut report)?;
            self.persist()?;
        }
        info!(
            opened = report.opened,
            flipped = report.flipped,
            tightened = report.tightened,
            skipped = report.skipped,
            "signals processed"
        );
        Ok(report)
    }

    fn apply_signal(
        &mut self,
        signal: &EntrySignal,
        report: &mut SignalReport,
    ) -> Result<(), RouterError> {
        let key = signal.strategy_key.as_str();
        let Some(descriptor) = self.book.resolve(key) else {
            warn!(%key, "cannot resolve descriptor, signal skipped");
            report.skipped += 1;
            return Ok(());
        };
        let side = signal.action.side();
        let fill = side.entry_fill(signal.price, descriptor.slippage());

        if let Some(current) = self.state.positions.get_mut(key) {
            if current.direction == side {
                if current.position.tighten_stop(side, signal.stop_price) {
                    debug!(%key, stop = signal.stop_price, "stop tightened");
                    report.tightened += 1;
                }
                return Ok(());
            }

            // Opposite side: close at the signal fill and stay flat.
            let held = current.direction;
            let Some(closed) = self.state.positions.remove(key) else {
                return Ok(());
            };
            let pos = closed.position;
            let pnl = held.pnl(pos.entry_price(), fill, pos.quantity());
            let fee = pos.notional(fill) * descriptor.fee_rate();
            self.state.realize(pnl - fee);
            info!(%key, closed = %held, price = fill, pnl, "position flipped flat");
            self.log(LedgerEntry::fill(
                signal.time,
                key,
                Some(&descriptor),
                LedgerEvent::CloseFlip,
                held,
                fill,
                pos.quantity(),
                fee,
                pnl,
                self.state.equity,
                "FLIP",
            ))?;
            report.flipped += 1;
            return Ok(());
        }

        let equity = self.state.equity;
        let notional = position_notional(
            self.risk_amount(key, &descriptor),
            fill,
            signal.stop_price,
            equity * self.settings.max_leverage,
            Some(self.settings.max_notional),
        );
        let Some(position) =
            notional.and_then(|n| OpenPosition::new(n / fill, fill, signal.stop_price, signal.time))
        else {
            debug!(%key, "zero size, signal skipped");
            report.skipped += 1;
            return Ok(());
        };

        let qty = position.quantity();
        let fee = position.notional(fill) * descriptor.fee_rate();
        self.state.equity -= fee;
        self.state.positions.insert(
            key.to_string(),
            TrackedPosition {
                direction: side,
                position,
                last_checked: Some(signal.time),
            },
        );
        info!(%key, %side, price = fill, qty, "position opened");
        self.log(LedgerEntry::fill(
            signal.time,
            key,
            Some(&descriptor),
            LedgerEvent::Open,
            side,
            fill,
            qty,
            fee,
            0.0,
            self.state.equity,
            "ENTRY",
        ))?;
        report.opened += 1;
        Ok(())
    }

    // ─── Risk ────────────────────────────────────────────────────────

    /// Realised today plus mark-to-market of every resolvable position.
    pub fn daily_pnl(&self, data: &dyn MarketData) -> f64 {
        let mtm: f64 = self
            .state
            .positions
            .iter()
            .filter_map(|(key, p)| {
                let d = self.book.resolve(key)?;
                Some(p.unrealized_pnl(Self::last_close(data, &d)?))
            })
            .sum();
        self.state.realized_today + mtm
    }

    /// Trip the kill-switch when today's P&L is at or below
    /// `-limit × day_start_equity`: close everything, write the marker.
    pub fn check_daily_limit(&mut self, data: &dyn MarketData) -> Result<bool, RouterError> {
        let limit = -self.settings.daily_loss_limit_pct.abs() * self.state.day_start_equity;
        let pnl = self.daily_pnl(data);
        if pnl > limit {
            return Ok(false);
        }
        warn!(pnl, limit, "daily loss limit reached");
        self.close_all(data, "DAILY_LIMIT")?;
        self.killswitch.trip()?;
        self.log(LedgerEntry::account(
            self.clock.now(),
            LedgerEvent::Killswitch,
            self.state.equity,
            "DAILY_LIMIT",
        ))?;
        self.persist()?;
        Ok(true)
    }

    /// Close every position at its latest close (fee, no slippage).
    ///
    /// Positions whose descriptor or data cannot be found are dropped without
    /// a fill. Returns the number of positions closed at a price.
    pub fn close_all(&mut self, data: &dyn MarketData, reason: &str) -> Result<usize, RouterError> {
        let mut closed = 0;
        let keys: Vec<String> = self.state.positions.keys().cloned().collect();
        for key in keys {
            let Some(tracked) = self.state.positions.remove(&key) else {
                continue;
            };
            let priced = self
                .book
                .resolve(&key)
                .and_then(|d| Self::last_close(data, &d).map(|px| (d, px)));
            let Some((descriptor, price)) = priced else {
                warn!(%key, "no descriptor or data, position dropped without fill");
                self.persist()?;
                continue;
            };
            let side = tracked.direction;
            let pos = tracked.position;
            let pnl = side.pnl(pos.entry_price(), price, pos.quantity());
            let fee = pos.notional(price) * descriptor.fee_rate();
            self.state.realize(pnl - fee);
            self.log(LedgerEntry::fill(
                self.clock.now(),
                &key,
                Some(&descriptor),
                LedgerEvent::CloseAll,
                side,
                price,
                pos.quantity(),
                fee,
                pnl,
                self.state.equity,
                reason,
            ))?;
            self.persist()?;
            closed += 1;
        }
        if closed > 0 {
            info!(closed, reason, equity = self.state.equity, "positions closed");
        }
        Ok(closed)
    }
}
