//! Equity curve: one account value per simulated bar.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: f64,
}

/// Time-ordered equity values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquityCurve {
    points: Vec<EquityPoint>,
}

impl EquityCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            points: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, time: DateTime<Utc>, equity: f64) {
        self.points.push(EquityPoint { time, equity });
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<f64> {
        self.points.first().map(|p| p.equity)
    }

    pub fn last(&self) -> Option<f64> {
        self.points.last().map(|p| p.equity)
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.equity).collect()
    }

    /// Last equity value of each UTC calendar day, in date order.
    pub fn daily_last(&self) -> Vec<(NaiveDate, f64)> {
        let mut out: Vec<(NaiveDate, f64)> = Vec::new();
        for p in &self.points {
            let day = p.time.date_naive();
            match out.last_mut() {
                Some((d, v)) if *d == day => *v = p.equity,
                _ => out.push((day, p.equity)),
            }
        }
        out
    }

    /// Last equity value of each calendar month, keyed by (year, month).
    pub fn month_end_last(&self) -> Vec<((i32, u32), f64)> {
        let mut out: Vec<((i32, u32), f64)> = Vec::new();
        for p in &self.points {
            let month = (p.time.year(), p.time.month());
            match out.last_mut() {
                Some((m, v)) if *m == month => *v = p.equity,
                _ => out.push((month, p.equity)),
            }
        }
        out
    }

    /// Curve divided by its first value, so it starts at 1.0.
    ///
    /// Empty when the curve is empty or starts at zero.
    pub fn normalized(&self) -> EquityCurve {
        match self.first() {
            Some(first) if first != 0.0 => EquityCurve {
                points: self
                    .points
                    .iter()
                    .map(|p| EquityPoint {
                        time: p.time,
                        equity: p.equity / first,
                    })
                    .collect(),
            },
            _ => EquityCurve::new(),
        }
    }
}

impl FromIterator<(DateTime<Utc>, f64)> for EquityCurve {
    fn from_iter<I: IntoIterator<Item = (DateTime<Utc>, f64)>>(iter: I) -> Self {
        Self {
            points: iter
                .into_iter()
                .map(|(time, equity)| EquityPoint { time, equity })
                .collect(),
        }
    }
}
