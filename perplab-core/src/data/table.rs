//! PriceTable: strictly increasing, deduplicated bars at native granularity.

use std::borrow::Cow;

use chrono::{DateTime, TimeZone, Utc};

use super::DataError;
use crate::domain::{Bar, Timeframe};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    bars: Vec<Bar>,
}

impl PriceTable {
    /// Wrap bars that are already strictly increasing in time.
    pub fn new(bars: Vec<Bar>) -> Result<Self, DataError> {
        if let Some(row) = bars.windows(2).position(|w| w[1].time <= w[0].time) {
            return Err(DataError::Unordered { row: row + 1 });
        }
        Ok(Self { bars })
    }

    /// Sort by time and drop duplicate timestamps, keeping the last row seen.
    pub fn from_unsorted(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.time);
        let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match out.last_mut() {
                Some(prev) if prev.time == bar.time => *prev = bar,
                _ => out.push(bar),
            }
        }
        Self { bars: out }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.time)
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.time)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    /// Rows `[start, end)`, clamped to the table.
    pub fn slice(&self, start: usize, end: usize) -> PriceTable {
        let end = end.min(self.bars.len());
        let start = start.min(end);
        Self {
            bars: self.bars[start..end].to_vec(),
        }
    }

    /// Rows at or after `cutoff`.
    pub fn since(&self, cutoff: DateTime<Utc>) -> PriceTable {
        let start = self.bars.partition_point(|b| b.time < cutoff);
        self.slice(start, self.bars.len())
    }

    /// Aggregate to `timeframe` buckets.
    ///
    /// Buckets are left-labelled and left-closed on UTC multiples of the
    /// timeframe; open = first, high = max, low = min, close = last,
    /// volume and funding summed. Empty buckets never appear. The native
    /// one-minute timeframe passes through borrowed.
    pub fn resample(&self, timeframe: Timeframe) -> Cow<'_, PriceTable> {
        if timeframe == Timeframe::M1 {
            return Cow::Borrowed(self);
        }
        let width = timeframe.minutes() * 60;
        let mut out: Vec<Bar> = Vec::with_capacity(self.bars.len() / timeframe.minutes() as usize + 1);
        let mut current: Option<(i64, Bar)> = None;

        for bar in &self.bars {
            let secs = bar.time.timestamp();
            let bucket = secs - secs.rem_euclid(width);
            match current.as_mut() {
                Some((b, agg)) if *b == bucket => {
                    agg.high = agg.high.max(bar.high);
                    agg.low = agg.low.min(bar.low);
                    agg.close = bar.close;
                    agg.volume += bar.volume;
                    agg.funding = match (agg.funding, bar.funding) {
                        (Some(a), Some(f)) => Some(a + f),
                        (a, f) => a.or(f),
                    };
                }
                _ => {
                    if let Some((_, done)) = current.take() {
                        out.push(done);
                    }
                    let time = Utc.timestamp_opt(bucket, 0).single().unwrap_or(bar.time);
                    current = Some((bucket, Bar { time, ..bar.clone() }));
                }
            }
        }
        if let Some((_, done)) = current {
            out.push(done);
        }
        Cow::Owned(Self { bars: out })
    }

    /// Deterministic content hash of the table (hex blake3).
    pub fn dataset_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for b in &self.bars {
            hasher.update(&b.time.timestamp_millis().to_le_bytes());
            for v in [b.open, b.high, b.low, b.close, b.volume] {
                hasher.update(&v.to_le_bytes());
            }
            hasher.update(&b.funding.unwrap_or(0.0).to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
