//! Per-market price tables shared by every pipeline stage.

use std::collections::BTreeMap;
use std::path::Path;

use perplab_core::data::{load_price_table, PriceTable};
use perplab_core::domain::Market;
use tracing::{info, warn};

/// Read access to native price tables by market.
///
/// The router and the signal emitter take this instead of a concrete store so
/// tests can hand them in-memory tables.
pub trait MarketData {
    fn table(&self, market: Market) -> Option<&PriceTable>;
}

/// Price tables loaded for a set of markets.
#[derive(Debug, Clone, Default)]
pub struct MarketTables {
    tables: BTreeMap<Market, PriceTable>,
}

impl MarketTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every market from `dir`. A market that fails to load is logged and
    /// left out; the others are unaffected.
    pub fn load(dir: &Path, markets: &[Market]) -> Self {
        let mut tables = BTreeMap::new();
        for &market in markets {
            match load_price_table(dir, market) {
                Ok(table) => {
                    info!(%market, bars = table.len(), hash = %table.dataset_hash(), "price table ready");
                    tables.insert(market, table);
                }
                Err(e) => warn!(%market, error = %e, "skipping market"),
            }
        }
        Self { tables }
    }

    pub fn insert(&mut self, market: Market, table: PriceTable) {
        self.tables.insert(market, table);
    }

    pub fn get(&self, market: Market) -> Option<&PriceTable> {
        self.tables.get(&market)
    }

    pub fn markets(&self) -> impl Iterator<Item = Market> + '_ {
        self.tables.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl MarketData for MarketTables {
    fn table(&self, market: Market) -> Option<&PriceTable> {
        self.get(market)
    }
}
