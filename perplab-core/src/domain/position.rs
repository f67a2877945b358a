//! Position state: flat, long or short, with the open leg carried inside.
//!
//! `Flat` carries no quantity at all, and an `OpenPosition` can only be built
//! with a strictly positive finite quantity, so "flat iff quantity is zero"
//! holds by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::Side;

/// Stored form of an open leg, validated into [`OpenPosition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOpenPosition {
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub funding_accrued: f64,
}

/// An open leg: quantity, fills and accumulated funding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOpenPosition", into = "RawOpenPosition")]
pub struct OpenPosition {
    quantity: f64,
    entry_price: f64,
    stop_price: f64,
    opened_at: DateTime<Utc>,
    funding_accrued: f64,
}

impl TryFrom<RawOpenPosition> for OpenPosition {
    type Error = String;

    fn try_from(raw: RawOpenPosition) -> Result<Self, Self::Error> {
        let mut pos = OpenPosition::new(raw.quantity, raw.entry_price, raw.stop_price, raw.opened_at)
            .ok_or_else(|| format!("invalid open position: quantity {}", raw.quantity))?;
        pos.funding_accrued = raw.funding_accrued;
        Ok(pos)
    }
}

impl From<OpenPosition> for RawOpenPosition {
    fn from(p: OpenPosition) -> Self {
        Self {
            quantity: p.quantity,
            entry_price: p.entry_price,
            stop_price: p.stop_price,
            opened_at: p.opened_at,
            funding_accrued: p.funding_accrued,
        }
    }
}

impl OpenPosition {
    /// Returns `None` unless quantity and entry price are positive and finite.
    pub fn new(
        quantity: f64,
        entry_price: f64,
        stop_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Option<Self> {
        if !(quantity.is_finite() && quantity > 0.0 && entry_price.is_finite() && entry_price > 0.0)
        {
            return None;
        }
        Some(Self {
            quantity,
            entry_price,
            stop_price,
            opened_at,
            funding_accrued: 0.0,
        })
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }
    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }
    pub fn stop_price(&self) -> f64 {
        self.stop_price
    }
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
    pub fn funding_accrued(&self) -> f64 {
        self.funding_accrued
    }

    /// Notional at `price`.
    pub fn notional(&self, price: f64) -> f64 {
        (self.quantity * price).abs()
    }

    pub(crate) fn accrue_funding(&mut self, amount: f64) {
        self.funding_accrued += amount;
    }

    /// Move the stop to `candidate` only if that is strictly more protective
    /// for a leg on `side`. Returns true when the stop moved.
    pub fn tighten_stop(&mut self, side: Side, candidate: f64) -> bool {
        if side.tightens(self.stop_price, candidate) {
            self.stop_price = candidate;
            return true;
        }
        false
    }
}

/// Tagged position state shared by the simulator and the router.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PositionState {
    #[default]
    Flat,
    Long(OpenPosition),
    Short(OpenPosition),
}

impl PositionState {
    pub fn open(side: Side, position: OpenPosition) -> Self {
        match side {
            Side::Long => PositionState::Long(position),
            Side::Short => PositionState::Short(position),
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, PositionState::Flat)
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            PositionState::Flat => None,
            PositionState::Long(_) => Some(Side::Long),
            PositionState::Short(_) => Some(Side::Short),
        }
    }

    /// Zero when flat, the leg's quantity otherwise.
    pub fn quantity(&self) -> f64 {
        self.position().map_or(0.0, OpenPosition::quantity)
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        match self {
            PositionState::Flat => None,
            PositionState::Long(p) | PositionState::Short(p) => Some(p),
        }
    }

    pub fn position_mut(&mut self) -> Option<&mut OpenPosition> {
        match self {
            PositionState::Flat => None,
            PositionState::Long(p) | PositionState::Short(p) => Some(p),
        }
    }

    /// Move to flat, returning the closed leg if there was one.
    pub fn take(&mut self) -> Option<(Side, OpenPosition)> {
        match std::mem::take(self) {
            PositionState::Flat => None,
            PositionState::Long(p) => Some((Side::Long, p)),
            PositionState::Short(p) => Some((Side::Short, p)),
        }
    }

    /// Replace the stop only if `candidate` is strictly more protective.
    ///
    /// Returns true when the stop moved.
    pub fn tighten_stop(&mut self, candidate: f64) -> bool {
        match self {
            PositionState::Flat => false,
            PositionState::Long(p) => p.tighten_stop(Side::Long, candidate),
            PositionState::Short(p) => p.tighten_stop(Side::Short, candidate),
        }
    }

    /// Mark-to-market profit at `price`; zero when flat.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match (self.side(), self.position()) {
            (Some(side), Some(p)) => side.pnl(p.entry_price, price, p.quantity),
            _ => 0.0,
        }
    }
}
