//! Price tables: validated storage, timeframe resampling, and file loading.

pub mod loader;
pub mod table;

use std::path::PathBuf;
use thiserror::Error;

pub use loader::{load_price_table, price_table_path, save_parquet};
pub use table::PriceTable;

/// Structured error types for price data operations.
///
/// A `DataError` is fatal for the market it concerns only; callers keep going
/// with the other markets.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("no price table for {market} under {dir}")]
    Missing { market: String, dir: PathBuf },

    #[error("missing column '{column}' in {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("timestamps not strictly increasing at row {row}")]
    Unordered { row: usize },

    #[error("empty price table: {0}")]
    Empty(String),

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
