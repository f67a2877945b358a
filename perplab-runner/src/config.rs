//! Pipeline configuration loaded from TOML.
//!
//! Every section is optional and falls back to its defaults, so an empty file
//! is a valid configuration. Validation runs once after parsing; everything
//! downstream receives an already-checked `PipelineConfig`.

use std::path::{Path, PathBuf};

use perplab_core::domain::Market;
use perplab_core::engine::SimConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("at least one market must be configured")]
    NoMarkets,
    #[error("{field} = {value} is invalid: {reason}")]
    Invalid {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },
}

// ─── Sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `{SYMBOL}_1m.parquet` / `.csv` price tables.
    pub data_dir: PathBuf,
    /// Root of every artifact directory.
    pub results_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/processed/ohlcv"),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl PathsConfig {
    pub fn backtests_dir(&self) -> PathBuf {
        self.results_dir.join("backtests")
    }

    pub fn forward_dir(&self) -> PathBuf {
        self.results_dir.join("forward_tests")
    }

    pub fn portfolios_dir(&self) -> PathBuf {
        self.results_dir.join("portfolios")
    }

    pub fn live_dir(&self) -> PathBuf {
        self.results_dir.join("live")
    }

    pub fn paper_dir(&self) -> PathBuf {
        self.results_dir.join("paper_trading")
    }

    pub fn selection_path(&self) -> PathBuf {
        self.portfolios_dir().join("selection.json")
    }

    pub fn signals_path(&self) -> PathBuf {
        self.live_dir().join("signals.csv")
    }

    /// Descriptor collections searched, in order, when resolving a key.
    pub fn descriptor_sources(&self) -> Vec<PathBuf> {
        vec![
            self.portfolios_dir().join("accepted_intersection.json"),
            self.backtests_dir().join("accepted_strategies.json"),
            self.forward_dir().join("accepted_strategies.json"),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub starting_capital: f64,
    pub risk_per_trade_target: f64,
    pub risk_per_trade_max: f64,
    pub max_leverage: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_capital: 10_000.0,
            risk_per_trade_target: 0.005,
            risk_per_trade_max: 0.01,
            max_leverage: 3.0,
        }
    }
}

impl RiskConfig {
    /// Account inputs for every simulation run by the pipeline.
    pub fn sim_config(&self) -> SimConfig {
        SimConfig::new(self.starting_capital, self.max_leverage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceConfig {
    pub avg_monthly_return_min: f64,
    pub max_drawdown_abs_max: f64,
    pub worst_month_min: f64,
    pub min_trades: usize,
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            avg_monthly_return_min: 0.02,
            max_drawdown_abs_max: 0.30,
            worst_month_min: -0.10,
            min_trades: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub oos_fraction: f64,
    pub n_splits: usize,
    /// Passes required for global acceptance; `None` means every split.
    pub min_passes: Option<usize>,
    /// Markets with fewer native bars are skipped.
    pub min_history_bars: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            oos_fraction: 0.60,
            n_splits: 1,
            min_passes: Some(1),
            min_history_bars: 100,
        }
    }
}

impl ForwardConfig {
    pub fn effective_min_passes(&self) -> usize {
        self.min_passes.unwrap_or(self.n_splits).clamp(1, self.n_splits.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub correlation_cap: f64,
    pub max_weight_per_strategy: f64,
    pub max_weight_per_market: f64,
    pub max_strategies: usize,
    pub cap_iterations: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            correlation_cap: 0.60,
            max_weight_per_strategy: 0.40,
            max_weight_per_market: 0.60,
            max_strategies: 10,
            cap_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub killswitch_path: PathBuf,
    /// Absolute notional ceiling per position; 0 disables it.
    pub max_notional: f64,
    pub daily_loss_limit_pct: f64,
    pub use_portfolio_weights: bool,
    /// Resampled bars inspected for fresh entries by the signal emitter.
    pub signal_lookback_bars: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            killswitch_path: PathBuf::from("results/live/KILL"),
            max_notional: 0.0,
            daily_loss_limit_pct: 0.02,
            use_portfolio_weights: true,
            signal_lookback_bars: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub lookback_days: i64,
    pub poll_seconds: u64,
    /// Write the per-strategy trade summary after each paper run.
    pub analyze_trades: bool,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            lookback_days: 14,
            poll_seconds: 300,
            analyze_trades: true,
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub markets: Vec<Market>,
    pub paths: PathsConfig,
    pub risk: RiskConfig,
    pub acceptance: AcceptanceConfig,
    pub forward: ForwardConfig,
    pub portfolio: PortfolioConfig,
    pub live: LiveConfig,
    pub paper: PaperConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            markets: Market::ALL.to_vec(),
            paths: PathsConfig::default(),
            risk: RiskConfig::default(),
            acceptance: AcceptanceConfig::default(),
            forward: ForwardConfig::default(),
            portfolio: PortfolioConfig::default(),
            live: LiveConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.markets.is_empty() {
            return Err(ConfigError::NoMarkets);
        }
        let r = &self.risk;
        check(
            "risk.starting_capital",
            r.starting_capital,
            r.starting_capital.is_finite() && r.starting_capital > 0.0,
            "must be positive",
        )?;
        check(
            "risk.risk_per_trade_target",
            r.risk_per_trade_target,
            (0.0025..=0.015).contains(&r.risk_per_trade_target),
            "must be between 0.25% and 1.5%",
        )?;
        check(
            "risk.risk_per_trade_max",
            r.risk_per_trade_max,
            r.risk_per_trade_max > 0.0 && r.risk_per_trade_max <= 0.02,
            "must be in (0, 2%]",
        )?;
        check(
            "risk.risk_per_trade_target",
            r.risk_per_trade_target,
            r.risk_per_trade_target <= r.risk_per_trade_max,
            "cannot exceed risk_per_trade_max",
        )?;
        check(
            "risk.max_leverage",
            r.max_leverage,
            r.max_leverage > 0.0 && r.max_leverage <= 5.0,
            "must be in (0, 5]",
        )?;

        let p = &self.portfolio;
        for (field, value) in [
            ("portfolio.correlation_cap", p.correlation_cap),
            ("portfolio.max_weight_per_strategy", p.max_weight_per_strategy),
            ("portfolio.max_weight_per_market", p.max_weight_per_market),
        ] {
            check(field, value, value > 0.0 && value <= 1.0, "must be in (0, 1]")?;
        }

        let f = &self.forward;
        check(
            "forward.oos_fraction",
            f.oos_fraction,
            f.oos_fraction > 0.0 && f.oos_fraction <= 1.0,
            "must be in (0, 1]",
        )?;
        check(
            "forward.n_splits",
            f.n_splits as f64,
            f.n_splits >= 1,
            "must be at least 1",
        )?;

        let l = &self.live;
        check(
            "live.daily_loss_limit_pct",
            l.daily_loss_limit_pct,
            l.daily_loss_limit_pct > 0.0 && l.daily_loss_limit_pct < 1.0,
            "must be in (0, 1)",
        )?;
        check(
            "live.max_notional",
            l.max_notional,
            l.max_notional >= 0.0,
            "must be non-negative",
        )?;
        Ok(())
    }
}

fn check(field: &'static str, value: f64, ok: bool, reason: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            value,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let c = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(c, PipelineConfig::default());
        assert_eq!(c.portfolio.correlation_cap, 0.60);
        assert_eq!(c.forward.effective_min_passes(), 1);
        assert_eq!(c.paper.poll_seconds, 300);
        assert!(c.paper.analyze_trades);
        assert_eq!(c.live.killswitch_path, PathBuf::from("results/live/KILL"));
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let c = PipelineConfig::from_toml_str(
            r#"
            markets = ["BTCUSDT", "SOLUSDT"]

            [risk]
            max_leverage = 2.0

            [forward]
            n_splits = 3
            "#,
        )
        .unwrap();
        assert_eq!(c.markets, vec![Market::Btcusdt, Market::Solusdt]);
        assert_eq!(c.risk.max_leverage, 2.0);
        assert_eq!(c.risk.starting_capital, 10_000.0);
        assert_eq!(c.forward.n_splits, 3);
        assert_eq!(c.forward.effective_min_passes(), 1);
    }

    #[test]
    fn min_passes_absent_means_every_split() {
        let f = ForwardConfig {
            n_splits: 4,
            min_passes: None,
            ..ForwardConfig::default()
        };
        assert_eq!(f.effective_min_passes(), 4);
    }

    #[test]
    fn unknown_market_is_a_parse_error() {
        let err = PipelineConfig::from_toml_str(r#"markets = ["DOGEUSDT"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn risk_ranges_are_enforced() {
        let bad_target = "[risk]\nrisk_per_trade_target = 0.02\nrisk_per_trade_max = 0.02";
        assert!(matches!(
            PipelineConfig::from_toml_str(bad_target),
            Err(ConfigError::Invalid {
                field: "risk.risk_per_trade_target",
                ..
            })
        ));

        let inverted = "[risk]\nrisk_per_trade_target = 0.012\nrisk_per_trade_max = 0.01";
        assert!(PipelineConfig::from_toml_str(inverted).is_err());

        let leverage = "[risk]\nmax_leverage = 6.0";
        assert!(PipelineConfig::from_toml_str(leverage).is_err());
    }

    #[test]
    fn empty_market_list_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("markets = []"),
            Err(ConfigError::NoMarkets)
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PipelineConfig::load(Path::new("/nonexistent/perplab.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
