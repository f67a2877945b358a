//! Persisted router state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use perplab_core::domain::{OpenPosition, Side};
use perplab_core::signals::{EntrySignal, SignalAction};
use serde::{Deserialize, Serialize};

/// An open paper position and its stop-check watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub direction: Side,
    #[serde(flatten)]
    pub position: OpenPosition,
    /// Time of the last bar examined for a stop breach.
    pub last_checked: Option<DateTime<Utc>>,
}

impl TrackedPosition {
    /// Bars strictly after this instant still need a stop check.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.last_checked.unwrap_or(self.position.opened_at())
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.direction.pnl(
            self.position.entry_price(),
            price,
            self.position.quantity(),
        )
    }
}

/// Identity of a signal for idempotent processing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId {
    pub time: DateTime<Utc>,
    pub strategy_key: String,
    pub action: SignalAction,
}

impl From<&EntrySignal> for SignalId {
    fn from(s: &EntrySignal) -> Self {
        Self {
            time: s.time,
            strategy_key: s.strategy_key.clone(),
            action: s.action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterState {
    pub equity: f64,
    pub positions: BTreeMap<String, TrackedPosition>,
    /// Every signal id ever consumed. Never pruned: the feed is append-only,
    /// so any id still in it must stay known. Grows with the feed.
    pub processed_signals: BTreeSet<SignalId>,
    /// UTC date the daily counters belong to.
    pub day_tag: NaiveDate,
    pub day_start_equity: f64,
    pub realized_today: f64,
}

impl RouterState {
    pub fn fresh(equity: f64, today: NaiveDate) -> Self {
        Self {
            equity,
            positions: BTreeMap::new(),
            processed_signals: BTreeSet::new(),
            day_tag: today,
            day_start_equity: equity,
            realized_today: 0.0,
        }
    }

    /// Book a realised P&L net of fees into equity and today's total.
    pub fn realize(&mut self, net: f64) {
        self.equity += net;
        self.realized_today += net;
    }
}
