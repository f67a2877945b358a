//! Market, timeframe, direction and side enums.
//!
//! All four serialize to the short string forms used in descriptor files,
//! signal feeds and the order log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Perpetual futures markets the pipeline knows how to trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    Btcusdt,
    Ethusdt,
    Solusdt,
}

impl Market {
    pub const ALL: [Market; 3] = [Market::Btcusdt, Market::Ethusdt, Market::Solusdt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Btcusdt => "BTCUSDT",
            Market::Ethusdt => "ETHUSDT",
            Market::Solusdt => "SOLUSDT",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Market::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unsupported market '{s}'"))
    }
}

/// Bar aggregation granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    #[default]
    M15,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            other => Err(format!("unsupported timeframe '{other}'")),
        }
    }
}

/// Which sides a descriptor is allowed to enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    #[default]
    Both,
}

impl Direction {
    pub fn allows(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Direction::Both, _) | (Direction::Long, Side::Long) | (Direction::Short, Side::Short)
        )
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            "both" => Ok(Direction::Both),
            other => Err(format!("unsupported direction '{other}'")),
        }
    }
}

/// Side of an open position or an entry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Price after slippage for opening a position on this side.
    pub fn entry_fill(&self, price: f64, slippage: f64) -> f64 {
        price * (1.0 + self.sign() * slippage)
    }

    /// Price after slippage for closing a position on this side.
    pub fn exit_fill(&self, price: f64, slippage: f64) -> f64 {
        price * (1.0 - self.sign() * slippage)
    }

    /// Stop price placed `stop_fraction` away from `entry` against this side.
    pub fn stop_from(&self, entry: f64, stop_fraction: f64) -> f64 {
        entry * (1.0 - self.sign() * stop_fraction)
    }

    /// Profit of moving from `entry` to `exit` with `quantity` units.
    pub fn pnl(&self, entry: f64, exit: f64, quantity: f64) -> f64 {
        self.sign() * (exit - entry) * quantity
    }

    /// Whether a bar with this high/low range touches `stop`.
    pub fn stop_breached(&self, stop: f64, high: f64, low: f64) -> bool {
        match self {
            Side::Long => low <= stop,
            Side::Short => high >= stop,
        }
    }

    /// Whether `candidate` is strictly more protective than `current`.
    pub fn tightens(&self, current: f64, candidate: f64) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.write_str("long"),
            Side::Short => f.write_str("short"),
        }
    }
}
