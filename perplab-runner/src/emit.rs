//! Signal emitter: fresh entry signals for the strategies currently traded.

use perplab_core::signals::{recent_entry_signals, EntrySignal};
use tracing::{debug, info, warn};

use crate::market_data::MarketData;
use crate::router::{DescriptorBook, RouterError, SignalFeed};

/// Entry signals on the last `lookback_bars` resampled bars of every key.
///
/// Keys that do not resolve to a descriptor, and markets without data, are
/// skipped. Output is sorted by time, then key.
pub fn emit_signals(
    data: &dyn MarketData,
    book: &DescriptorBook,
    keys: &[String],
    lookback_bars: usize,
) -> Vec<EntrySignal> {
    let mut out = Vec::new();
    for key in keys {
        let Some(descriptor) = book.resolve(key) else {
            warn!(%key, "cannot resolve descriptor, no signals");
            continue;
        };
        let Some(table) = data.table(descriptor.market()) else {
            debug!(%key, "no price data");
            continue;
        };
        out.extend(recent_entry_signals(table, &descriptor, lookback_bars));
    }
    out.sort_by(|a, b| {
        a.time
            .cmp(&b.time)
            .then_with(|| a.strategy_key.cmp(&b.strategy_key))
    });
    out
}

/// Detect signals and append the new ones to `feed`. Returns the number
/// appended.
pub fn emit_to_feed(
    data: &dyn MarketData,
    book: &DescriptorBook,
    keys: &[String],
    lookback_bars: usize,
    feed: &SignalFeed,
) -> Result<usize, RouterError> {
    let signals = emit_signals(data, book, keys, lookback_bars);
    feed.touch()?;
    let appended = feed.append_new(&signals)?;
    info!(
        detected = signals.len(),
        appended,
        feed = %feed.path().display(),
        "signals emitted"
    );
    Ok(appended)
}
