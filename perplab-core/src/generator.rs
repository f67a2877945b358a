//! Seeded candidate generator for MA crossover descriptors.
//!
//! Same seed, same markets, same count → same candidates.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::domain::{ConfigError, Market, RawDescriptor, StrategyDescriptor};

const STOP_CHOICES: [f64; 6] = [0.003, 0.005, 0.008, 0.010, 0.015, 0.020];
const TIMEFRAME_CHOICES: [&str; 2] = ["5m", "15m"];
const TREND_CHOICES: [f64; 4] = [0.0, 0.001, 0.002, 0.003];
const ATR_CHOICES: [f64; 4] = [0.0, 0.002, 0.005, 0.010];

/// Parameters of a generation pass.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub per_market: usize,
    pub risk_fraction: f64,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            per_market: 20,
            risk_fraction: 0.005,
            seed: 42,
        }
    }
}

/// Generate `per_market` candidates for each market.
///
/// fast ∈ [5, 20], slow ∈ [fast + 5, 60], stop, timeframe and filters drawn
/// from fixed menus, direction both, ATR period 14.
pub fn generate_candidates(
    markets: &[Market],
    config: &GeneratorConfig,
) -> Result<Vec<StrategyDescriptor>, ConfigError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut out = Vec::with_capacity(markets.len() * config.per_market);

    for market in markets {
        for _ in 0..config.per_market {
            let fast = rng.gen_range(5..=20);
            let slow = rng.gen_range(fast + 5..=60);
            let mut raw = RawDescriptor::new(
                market.as_str(),
                fast,
                slow,
                *STOP_CHOICES.choose(&mut rng).unwrap_or(&0.01),
                config.risk_fraction,
            );
            raw.timeframe = TIMEFRAME_CHOICES
                .choose(&mut rng)
                .unwrap_or(&"15m")
                .to_string();
            raw.trend_tol = *TREND_CHOICES.choose(&mut rng).unwrap_or(&0.0);
            raw.atr_thresh = *ATR_CHOICES.choose(&mut rng).unwrap_or(&0.0);
            out.push(StrategyDescriptor::try_from(raw)?);
        }
    }
    Ok(out)
}
