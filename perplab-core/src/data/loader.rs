//! Price table loading from Parquet (preferred) or CSV.
//!
//! Layout: `{dir}/{SYMBOL}_1m.parquet` or `{dir}/{SYMBOL}_1m.csv`
//!
//! Required columns: a timestamp column (`timestamp`, `time`, `open_time`
//! or a pandas index column), open, high, low, close. Optional: volume,
//! funding_rate. Rows are sorted and deduplicated on load.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use polars::prelude::*;
use serde::Deserialize;
use tracing::debug;

use super::{DataError, PriceTable};
use crate::domain::{Bar, Market};

const TIME_COLUMNS: [&str; 4] = ["timestamp", "time", "open_time", "__index_level_0__"];
const PRICE_COLUMNS: [&str; 4] = ["open", "high", "low", "close"];

/// Path of the native table for `market`, preferring Parquet when present.
pub fn price_table_path(dir: &Path, market: Market) -> Option<PathBuf> {
    ["parquet", "csv"]
        .iter()
        .map(|ext| dir.join(format!("{}_1m.{ext}", market.as_str())))
        .find(|p| p.exists())
}

/// Load the native one-minute table for `market` from `dir`.
pub fn load_price_table(dir: &Path, market: Market) -> Result<PriceTable, DataError> {
    let path = price_table_path(dir, market).ok_or_else(|| DataError::Missing {
        market: market.to_string(),
        dir: dir.to_path_buf(),
    })?;
    let bars = match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => read_parquet(&path)?,
        _ => read_csv(&path)?,
    };
    if bars.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }
    let table = PriceTable::from_unsorted(bars);
    debug!(market = %market, rows = table.len(), path = %path.display(), "loaded price table");
    Ok(table)
}

// ── CSV ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "time", alias = "open_time")]
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    funding_rate: Option<f64>,
}

fn read_csv(path: &Path) -> Result<Vec<Bar>, DataError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let headers = rdr.headers()?.clone();
    let has = |name: &str| headers.iter().any(|h| h == name);
    if !TIME_COLUMNS[..3].iter().any(|c| has(c)) {
        return Err(DataError::MissingColumn {
            column: "timestamp".into(),
            path: path.to_path_buf(),
        });
    }
    if let Some(missing) = PRICE_COLUMNS.iter().find(|c| !has(c)) {
        return Err(DataError::MissingColumn {
            column: missing.to_string(),
            path: path.to_path_buf(),
        });
    }

    let mut bars = Vec::new();
    for row in rdr.deserialize::<CsvRow>() {
        let row = row?;
        bars.push(Bar {
            time: parse_timestamp(&row.timestamp)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume.unwrap_or(0.0),
            funding: row.funding_rate,
        });
    }
    Ok(bars)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC), or integer epoch milliseconds.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DataError> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| DataError::Timestamp(raw.to_string()))
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn read_parquet(path: &Path) -> Result<Vec<Bar>, DataError> {
    let file = fs::File::open(path)?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::Parquet(format!("read {}: {e}", path.display())))?;

    let time_name = TIME_COLUMNS
        .iter()
        .find(|c| df.column(c).is_ok())
        .ok_or_else(|| DataError::MissingColumn {
            column: "timestamp".into(),
            path: path.to_path_buf(),
        })?;
    let times = timestamp_millis(df.column(time_name).map_err(parquet_err)?)?;

    let mut prices = Vec::with_capacity(PRICE_COLUMNS.len());
    for name in PRICE_COLUMNS {
        let column = df.column(name).map_err(|_| DataError::MissingColumn {
            column: name.to_string(),
            path: path.to_path_buf(),
        })?;
        prices.push(float_values(column)?);
    }
    let volume = match df.column("volume") {
        Ok(c) => float_values(c)?,
        Err(_) => vec![None; df.height()],
    };
    let funding = match df.column("funding_rate") {
        Ok(c) => float_values(c)?,
        Err(_) => vec![None; df.height()],
    };

    let mut bars = Vec::with_capacity(df.height());
    for (i, ms) in times.into_iter().enumerate() {
        let ms = ms.ok_or_else(|| DataError::Parquet(format!("null timestamp at row {i}")))?;
        let time = Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| DataError::Timestamp(ms.to_string()))?;
        bars.push(Bar {
            time,
            open: prices[0][i].unwrap_or(f64::NAN),
            high: prices[1][i].unwrap_or(f64::NAN),
            low: prices[2][i].unwrap_or(f64::NAN),
            close: prices[3][i].unwrap_or(f64::NAN),
            volume: volume[i].unwrap_or(0.0),
            funding: funding[i],
        });
    }
    Ok(bars)
}

fn parquet_err(e: PolarsError) -> DataError {
    DataError::Parquet(format!("column read: {e}"))
}

/// Convert a datetime (any unit) or integer-millisecond column to epoch ms.
fn timestamp_millis(column: &Column) -> Result<Vec<Option<i64>>, DataError> {
    let divisor = match column.dtype() {
        DataType::Datetime(TimeUnit::Nanoseconds, _) => 1_000_000,
        DataType::Datetime(TimeUnit::Microseconds, _) => 1_000,
        _ => 1,
    };
    let raw = column.cast(&DataType::Int64).map_err(parquet_err)?;
    let ca = raw.i64().map_err(parquet_err)?;
    Ok(ca.into_iter().map(|v| v.map(|x| x / divisor)).collect())
}

fn float_values(column: &Column) -> Result<Vec<Option<f64>>, DataError> {
    let cast = column.cast(&DataType::Float64).map_err(parquet_err)?;
    let ca = cast.f64().map_err(parquet_err)?;
    Ok(ca.into_iter().collect())
}

/// Write `table` as Parquet at `path`.
///
/// Writes are atomic: write to .tmp then rename.
pub fn save_parquet(table: &PriceTable, path: &Path) -> Result<(), DataError> {
    let bars = table.bars();
    let millis: Vec<i64> = bars.iter().map(|b| b.time.timestamp_millis()).collect();
    let col = |name: &str, f: fn(&Bar) -> f64| {
        Column::new(name.into(), bars.iter().map(f).collect::<Vec<f64>>())
    };
    let funding: Vec<Option<f64>> = bars.iter().map(|b| b.funding).collect();

    let mut df = DataFrame::new(vec![
        Column::new("timestamp".into(), millis)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| DataError::Parquet(format!("timestamp cast: {e}")))?,
        col("open", |b| b.open),
        col("high", |b| b.high),
        col("low", |b| b.low),
        col("close", |b| b.close),
        col("volume", |b| b.volume),
        Column::new("funding_rate".into(), funding),
    ])
    .map_err(|e| DataError::Parquet(format!("dataframe creation: {e}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path)?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| DataError::Parquet(format!("write parquet: {e}")))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::Io(e)
    })?;
    Ok(())
}
