//! Signal feed (`signals.csv`): append-only, deduplicated by signal id.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use perplab_core::signals::EntrySignal;
use tracing::warn;

use super::state::SignalId;
use super::RouterError;

const FEED_HEADER: [&str; 7] = [
    "time",
    "symbol",
    "timeframe",
    "action",
    "price",
    "stop_price",
    "strategy_key",
];

#[derive(Debug, Clone)]
pub struct SignalFeed {
    path: PathBuf,
}

impl SignalFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self) -> impl FnOnce(std::io::Error) -> RouterError + '_ {
        move |source| RouterError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// All signals in the feed; `None` when the file does not exist.
    ///
    /// Rows that fail to parse are logged and skipped.
    pub fn read(&self) -> Result<Option<Vec<EntrySignal>>, RouterError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut out = Vec::new();
        for row in rdr.deserialize() {
            match row {
                Ok(signal) => out.push(signal),
                Err(e) => {
                    let line = e.position().map(|p| p.line());
                    warn!(path = %self.path.display(), ?line, error = %e, "skipping malformed signal row");
                }
            }
        }
        Ok(Some(out))
    }

    /// Create the file with only a header if it is missing.
    pub fn touch(&self) -> Result<(), RouterError> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(self.io())?;
        }
        let mut wtr = csv::Writer::from_path(&self.path)?;
        wtr.write_record(FEED_HEADER)?;
        wtr.flush().map_err(self.io())?;
        Ok(())
    }

    /// Append the signals not already in the feed. Returns how many were new.
    pub fn append_new(&self, signals: &[EntrySignal]) -> Result<usize, RouterError> {
        let mut seen: HashSet<SignalId> = self
            .read()?
            .unwrap_or_default()
            .iter()
            .map(SignalId::from)
            .collect();
        let fresh: Vec<&EntrySignal> = signals
            .iter()
            .filter(|s| seen.insert(SignalId::from(*s)))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        self.touch()?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(self.io())?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for s in &fresh {
            wtr.serialize(s)?;
        }
        wtr.flush().map_err(self.io())?;
        Ok(fresh.len())
    }
}
