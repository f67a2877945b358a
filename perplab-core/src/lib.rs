//! PerpLab Core: domain types, price tables, indicators, simulator, metrics.
//!
//! This crate contains everything that runs on a single descriptor:
//! - Domain types (markets, timeframes, descriptors, positions, trades)
//! - Price tables with resampling and dataset hashing
//! - MA crossover signals with trend and volatility filters
//! - Bar-by-bar perpetual futures simulator (fees, slippage, funding, stops)
//! - Equity-curve metrics and the seeded candidate generator

pub mod data;
pub mod domain;
pub mod engine;
pub mod generator;
pub mod indicators;
pub mod metrics;
pub mod signals;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types handed between pipeline stages are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::Bar>();
        require_sync::<domain::Bar>();
        require_send::<domain::StrategyDescriptor>();
        require_sync::<domain::StrategyDescriptor>();
        require_send::<domain::PositionState>();
        require_sync::<domain::PositionState>();
        require_send::<domain::Trade>();
        require_sync::<domain::Trade>();
        require_send::<domain::EquityCurve>();
        require_sync::<domain::EquityCurve>();

        require_send::<data::PriceTable>();
        require_sync::<data::PriceTable>();

        require_send::<engine::SimConfig>();
        require_sync::<engine::SimConfig>();
        require_send::<engine::SimResult>();
        require_sync::<engine::SimResult>();

        require_send::<signals::EntrySignal>();
        require_sync::<signals::EntrySignal>();
        require_send::<metrics::SimMetrics>();
        require_sync::<metrics::SimMetrics>();
    }

    /// Architecture contract: the simulator sees bars and a descriptor, never
    /// account state from outside the run.
    #[test]
    fn simulator_signature_is_self_contained() {
        fn _check(
            table: &data::PriceTable,
            d: &domain::StrategyDescriptor,
            c: &engine::SimConfig,
        ) -> Result<engine::SimResult, engine::SimError> {
            engine::run_backtest(table, d, c)
        }
    }
}
