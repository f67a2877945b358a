//! Strategy descriptor: validated parameters of one MA crossover candidate.
//!
//! Loosely-typed records (JSON files, generator output) arrive as
//! [`RawDescriptor`] and become a [`StrategyDescriptor`] only through
//! `TryFrom`, which checks every field range. A `StrategyDescriptor` is
//! immutable; serde round-trips it through the raw record so descriptor
//! files keep their flat shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::market::{Direction, Market, Timeframe};

/// Longest moving-average window accepted.
pub const MAX_WINDOW: usize = 1000;
/// Exclusive upper bound on the per-trade risk fraction.
pub const MAX_RISK_FRACTION: f64 = 0.05;

/// Descriptor field that failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unsupported market '{0}'")]
    UnknownMarket(String),
    #[error("unsupported timeframe '{0}'")]
    UnknownTimeframe(String),
    #[error("unsupported direction '{0}'")]
    UnknownDirection(String),
    #[error("fast window {fast} must be below slow window {slow}")]
    WindowOrder { fast: i64, slow: i64 },
    #[error("{field} window {value} outside 1..={max}")]
    WindowBounds {
        field: &'static str,
        value: i64,
        max: usize,
    },
    #[error("{field} = {value} outside {range}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },
}

fn default_direction() -> String {
    "both".into()
}
fn default_timeframe() -> String {
    "15m".into()
}
fn default_fee_rate() -> f64 {
    0.0004
}
fn default_slippage() -> f64 {
    0.0002
}
fn default_atr_period() -> i64 {
    14
}

/// Descriptor record as stored on disk, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDescriptor {
    pub symbol: String,
    pub fast: i64,
    pub slow: i64,
    pub stop_loss_pct: f64,
    pub risk_fraction: f64,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default = "default_slippage")]
    pub slippage: f64,
    #[serde(default)]
    pub trend_tol: f64,
    #[serde(default)]
    pub atr_thresh: f64,
    #[serde(default = "default_atr_period")]
    pub atr_period: i64,
}

impl RawDescriptor {
    /// Record with the file defaults for everything but the core parameters.
    pub fn new(symbol: &str, fast: i64, slow: i64, stop_loss_pct: f64, risk_fraction: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            fast,
            slow,
            stop_loss_pct,
            risk_fraction,
            direction: default_direction(),
            timeframe: default_timeframe(),
            fee_rate: default_fee_rate(),
            slippage: default_slippage(),
            trend_tol: 0.0,
            atr_thresh: 0.0,
            atr_period: default_atr_period(),
        }
    }
}

/// Validated, immutable strategy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDescriptor", into = "RawDescriptor")]
pub struct StrategyDescriptor {
    market: Market,
    timeframe: Timeframe,
    fast: usize,
    slow: usize,
    stop_loss_pct: f64,
    risk_fraction: f64,
    fee_rate: f64,
    slippage: f64,
    direction: Direction,
    trend_tol: f64,
    atr_thresh: f64,
    atr_period: usize,
}

fn check_window(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value < 1 || value as usize > MAX_WINDOW {
        return Err(ConfigError::WindowBounds {
            field,
            value,
            max: MAX_WINDOW,
        });
    }
    Ok(value as usize)
}

fn check_fraction(
    field: &'static str,
    value: f64,
    ok: bool,
    range: &'static str,
) -> Result<f64, ConfigError> {
    if !ok || !value.is_finite() {
        return Err(ConfigError::OutOfRange { field, value, range });
    }
    Ok(value)
}

impl TryFrom<RawDescriptor> for StrategyDescriptor {
    type Error = ConfigError;

    fn try_from(raw: RawDescriptor) -> Result<Self, Self::Error> {
        let market = raw
            .symbol
            .parse::<Market>()
            .map_err(|_| ConfigError::UnknownMarket(raw.symbol.clone()))?;
        let timeframe = raw
            .timeframe
            .parse::<Timeframe>()
            .map_err(|_| ConfigError::UnknownTimeframe(raw.timeframe.clone()))?;
        let direction = raw
            .direction
            .parse::<Direction>()
            .map_err(|_| ConfigError::UnknownDirection(raw.direction.clone()))?;

        let fast = check_window("fast", raw.fast)?;
        let slow = check_window("slow", raw.slow)?;
        if fast >= slow {
            return Err(ConfigError::WindowOrder {
                fast: raw.fast,
                slow: raw.slow,
            });
        }
        let atr_period = check_window("atr_period", raw.atr_period)?;

        let s = raw.stop_loss_pct;
        let stop_loss_pct = check_fraction("stop_loss_pct", s, s > 0.0 && s < 1.0, "(0, 1)")?;
        let r = raw.risk_fraction;
        let risk_fraction = check_fraction(
            "risk_fraction",
            r,
            r > 0.0 && r < MAX_RISK_FRACTION,
            "(0, 0.05)",
        )?;
        let f = raw.fee_rate;
        let fee_rate = check_fraction("fee_rate", f, (0.0..1.0).contains(&f), "[0, 1)")?;
        let sl = raw.slippage;
        let slippage = check_fraction("slippage", sl, (0.0..1.0).contains(&sl), "[0, 1)")?;
        let t = raw.trend_tol;
        let trend_tol = check_fraction("trend_tol", t, t >= 0.0, "[0, inf)")?;
        let a = raw.atr_thresh;
        let atr_thresh = check_fraction("atr_thresh", a, a >= 0.0, "[0, inf)")?;

        Ok(Self {
            market,
            timeframe,
            fast,
            slow,
            stop_loss_pct,
            risk_fraction,
            fee_rate,
            slippage,
            direction,
            trend_tol,
            atr_thresh,
            atr_period,
        })
    }
}

impl From<StrategyDescriptor> for RawDescriptor {
    fn from(d: StrategyDescriptor) -> Self {
        Self {
            symbol: d.market.as_str().to_string(),
            fast: d.fast as i64,
            slow: d.slow as i64,
            stop_loss_pct: d.stop_loss_pct,
            risk_fraction: d.risk_fraction,
            direction: match d.direction {
                Direction::Long => "long",
                Direction::Short => "short",
                Direction::Both => "both",
            }
            .to_string(),
            timeframe: d.timeframe.as_str().to_string(),
            fee_rate: d.fee_rate,
            slippage: d.slippage,
            trend_tol: d.trend_tol,
            atr_thresh: d.atr_thresh,
            atr_period: d.atr_period as i64,
        }
    }
}

impl StrategyDescriptor {
    pub fn market(&self) -> Market {
        self.market
    }
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }
    pub fn fast(&self) -> usize {
        self.fast
    }
    pub fn slow(&self) -> usize {
        self.slow
    }
    pub fn stop_loss_pct(&self) -> f64 {
        self.stop_loss_pct
    }
    pub fn risk_fraction(&self) -> f64 {
        self.risk_fraction
    }
    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }
    pub fn slippage(&self) -> f64 {
        self.slippage
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn trend_tol(&self) -> f64 {
        self.trend_tol
    }
    pub fn atr_thresh(&self) -> f64 {
        self.atr_thresh
    }
    pub fn atr_period(&self) -> usize {
        self.atr_period
    }

    /// Identity key: `{SYMBOL}|f{fast}|s{slow}|sl{stop:.4}|{timeframe}`.
    pub fn key(&self) -> String {
        format!("{}|{}", self.base_key(), self.timeframe)
    }

    /// Key without the timeframe segment.
    pub fn base_key(&self) -> String {
        format!(
            "{}|f{}|s{}|sl{:.4}",
            self.market, self.fast, self.slow, self.stop_loss_pct
        )
    }

    /// Same parameters on a different timeframe.
    pub fn with_timeframe(&self, timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            ..self.clone()
        }
    }
}

/// Split a full identity key into its base key and timeframe segment.
///
/// Returns `None` when the key does not have the five `|`-separated parts.
pub fn split_key(key: &str) -> Option<(String, Timeframe)> {
    let parts: Vec<&str> = key.split('|').collect();
    if parts.len() != 5 {
        return None;
    }
    let timeframe = parts[4].parse::<Timeframe>().ok()?;
    Some((parts[..4].join("|"), timeframe))
}
