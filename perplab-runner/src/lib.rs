//! PerpLab Runner: pipeline stages built on top of `perplab-core`.
//!
//! Stages, in pipeline order:
//! - `backtest`: batch simulation and the metrics table
//! - `acceptance`: threshold filtering of a metrics table
//! - `forward`: trailing out-of-sample splits with a min-passes vote
//! - `portfolio`: correlation-bounded selection, risk parity, cap solver and
//!   an independent validation of the persisted selection
//! - `emit`: fresh entry signals for the selected strategies
//! - `router`: persisted paper execution with stops and a daily loss limit
//! - `paper`: weighted replay of the portfolio over recent history and the
//!   closed-trade summary
//!
//! `config` loads the TOML configuration, `export` owns artifact I/O and
//! `market_data` holds the per-market price tables every stage reads.

pub mod acceptance;
pub mod backtest;
pub mod config;
pub mod emit;
pub mod export;
pub mod forward;
pub mod market_data;
pub mod paper;
pub mod portfolio;
pub mod router;

pub use acceptance::{apply_acceptance, evaluate, AcceptanceReport, Verdict};
pub use backtest::{backtest_all, MetricsRow};
pub use config::{ConfigError, PipelineConfig};
pub use forward::{evaluate_forward, ForwardError, ForwardReport};
pub use market_data::{MarketData, MarketTables};
pub use paper::{run_paper, PaperReport, PaperStatus};
pub use portfolio::{
    build_portfolio, enforce_caps, validate_portfolio, CapOutcome, PortfolioError,
    PortfolioSelection, ValidationReport,
};
pub use router::{
    Clock, DescriptorBook, KillSwitch, Router, RouterError, RouterSettings, SignalFeed, SystemClock,
};

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

/// Portfolio weights from `selection.json`.
///
/// A missing selection yields no weights. A malformed one is logged and also
/// yields no weights, so sizing falls back to unweighted risk.
pub fn load_weights(selection_path: &Path) -> BTreeMap<String, f64> {
    match export::read_json_opt::<PortfolioSelection>(selection_path) {
        Ok(Some(selection)) => selection.weights,
        Ok(None) => BTreeMap::new(),
        Err(e) => {
            warn!(path = %selection_path.display(), error = %e, "ignoring unreadable selection");
            BTreeMap::new()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: stage outputs can be handed across threads.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<PipelineConfig>();
        require_sync::<PipelineConfig>();
        require_send::<MarketTables>();
        require_sync::<MarketTables>();
        require_send::<PortfolioSelection>();
        require_sync::<PortfolioSelection>();
        require_send::<CapOutcome>();
        require_sync::<CapOutcome>();
        require_send::<DescriptorBook>();
        require_sync::<DescriptorBook>();
    }

    #[test]
    fn weights_fall_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");
        assert!(load_weights(&path).is_empty());

        std::fs::write(&path, "not json").unwrap();
        assert!(load_weights(&path).is_empty());

        let mut selection = PortfolioSelection::empty();
        selection.weights.insert("BTCUSDT|f3|s5|sl0.0200|1m".into(), 1.0);
        export::write_json(&path, &selection).unwrap();
        assert_eq!(load_weights(&path).len(), 1);
    }
}
