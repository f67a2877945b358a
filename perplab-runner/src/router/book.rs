//! Descriptor lookup by portfolio key.
//!
//! Keys resolve exactly first; otherwise by base key, taking the timeframe
//! from the key's last segment. Among several sources the first one wins.

use std::collections::HashMap;
use std::path::PathBuf;

use perplab_core::domain::{split_key, RawDescriptor, StrategyDescriptor};
use tracing::{debug, warn};

use crate::export::read_json_opt;

#[derive(Debug, Clone, Default)]
pub struct DescriptorBook {
    exact: HashMap<String, StrategyDescriptor>,
    base: HashMap<String, StrategyDescriptor>,
}

impl DescriptorBook {
    pub fn new(descriptors: impl IntoIterator<Item = StrategyDescriptor>) -> Self {
        let mut book = Self::default();
        for d in descriptors {
            book.insert(d);
        }
        book
    }

    pub fn insert(&mut self, d: StrategyDescriptor) {
        self.base.entry(d.base_key()).or_insert_with(|| d.clone());
        self.exact.entry(d.key()).or_insert(d);
    }

    /// Gather descriptors from every readable source. Missing files are
    /// skipped quietly; malformed files and invalid records with a warning.
    pub fn load(sources: &[PathBuf]) -> Self {
        let mut book = Self::default();
        for path in sources {
            let raw: Vec<RawDescriptor> = match read_json_opt(path) {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping descriptor source");
                    continue;
                }
            };
            let mut added = 0usize;
            for r in raw {
                match StrategyDescriptor::try_from(r) {
                    Ok(d) => {
                        book.insert(d);
                        added += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "invalid descriptor"),
                }
            }
            debug!(path = %path.display(), added, "descriptor source loaded");
        }
        book
    }

    pub fn resolve(&self, key: &str) -> Option<StrategyDescriptor> {
        if let Some(d) = self.exact.get(key) {
            return Some(d.clone());
        }
        let (base, timeframe) = split_key(key)?;
        self.base.get(&base).map(|d| d.with_timeframe(timeframe))
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perplab_core::domain::Timeframe;

    fn d(tf: &str) -> StrategyDescriptor {
        let mut raw = RawDescriptor::new("BTCUSDT", 5, 20, 0.01, 0.005);
        raw.timeframe = tf.into();
        StrategyDescriptor::try_from(raw).unwrap()
    }

    #[test]
    fn exact_key_wins() {
        let book = DescriptorBook::new([d("5m"), d("15m")]);
        let got = book.resolve("BTCUSDT|f5|s20|sl0.0100|15m").unwrap();
        assert_eq!(got, d("15m"));
    }

    #[test]
    fn base_key_takes_timeframe_from_key() {
        let book = DescriptorBook::new([d("5m")]);
        let got = book.resolve("BTCUSDT|f5|s20|sl0.0100|1m").unwrap();
        assert_eq!(got.timeframe(), Timeframe::M1);
        assert_eq!(got.fast(), 5);
        assert!(book.resolve("BTCUSDT|f5|s21|sl0.0100|1m").is_none());
        assert!(book.resolve("garbage").is_none());
    }

    #[test]
    fn load_skips_missing_and_malformed_sources() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        let good = dir.path().join("good.json");
        std::fs::write(&bad, "[{").unwrap();
        std::fs::write(
            &good,
            r#"[{"symbol":"ETHUSDT","fast":7,"slow":30,"stop_loss_pct":0.005,"risk_fraction":0.01,"timeframe":"5m"},
                {"symbol":"ETHUSDT","fast":30,"slow":7,"stop_loss_pct":0.005,"risk_fraction":0.01}]"#,
        )
        .unwrap();
        let book = DescriptorBook::load(&[dir.path().join("absent.json"), bad, good]);
        assert_eq!(book.len(), 1);
        assert!(book.resolve("ETHUSDT|f7|s30|sl0.0050|5m").is_some());
    }
}
