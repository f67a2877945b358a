//! Batch stages chained the way the CLI runs them: backtest, forward splits,
//! portfolio, signal emission, then the router consuming the feed.

use chrono::{Duration, TimeZone, Utc};
use perplab_core::data::PriceTable;
use perplab_core::domain::{Bar, Market, RawDescriptor, StrategyDescriptor};
use perplab_runner::config::{AcceptanceConfig, ForwardConfig, PortfolioConfig};
use perplab_runner::emit::emit_to_feed;
use perplab_runner::export::{load_descriptors, read_json};
use perplab_runner::forward::{evaluate_forward, write_forward_artifacts, ForwardSummary};
use perplab_runner::market_data::MarketTables;
use perplab_runner::portfolio::{build_portfolio, validate_portfolio, write_portfolio_artifacts};
use perplab_runner::router::{DescriptorBook, ManualClock, Router, RouterSettings, SignalFeed};
use perplab_runner::{backtest_all, load_weights};

const DAYS: i64 = 5;

/// Minute bars oscillating ±5% around 100 with a 12-hour period.
fn wave(phase: f64) -> PriceTable {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let n = (DAYS * 1440) as usize;
    let closes: Vec<f64> = (0..n)
        .map(|i| {
            let x = (i as f64 + phase) / 720.0 * std::f64::consts::TAU;
            100.0 * (1.0 + 0.05 * x.sin())
        })
        .collect();
    let bars = closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Bar {
                time: t0 + Duration::minutes(i as i64),
                open,
                high: open.max(close) * 1.0005,
                low: open.min(close) * 0.9995,
                close,
                volume: 1.0,
                funding: None,
            }
        })
        .collect();
    PriceTable::new(bars).unwrap()
}

fn data() -> MarketTables {
    let mut data = MarketTables::new();
    data.insert(Market::Btcusdt, wave(0.0));
    data.insert(Market::Ethusdt, wave(180.0));
    data.insert(Market::Solusdt, wave(400.0));
    data
}

fn descriptor(symbol: &str, fast: i64, slow: i64, timeframe: &str) -> StrategyDescriptor {
    let mut raw = RawDescriptor::new(symbol, fast, slow, 0.01, 0.005);
    raw.timeframe = timeframe.into();
    StrategyDescriptor::try_from(raw).unwrap()
}

fn descriptors() -> Vec<StrategyDescriptor> {
    vec![
        descriptor("BTCUSDT", 10, 40, "5m"),
        descriptor("ETHUSDT", 10, 40, "5m"),
        descriptor("SOLUSDT", 8, 30, "15m"),
    ]
}

#[test]
fn batch_backtest_covers_every_descriptor() {
    let sim = perplab_core::engine::SimConfig::new(10_000.0, 3.0);
    let rows = backtest_all(&data(), &descriptors(), &sim);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.trades > 0));
}

#[test]
fn forward_splits_write_consistent_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let forward = ForwardConfig {
        n_splits: 3,
        min_passes: Some(2),
        ..ForwardConfig::default()
    };
    let acceptance = AcceptanceConfig {
        min_trades: 1,
        ..AcceptanceConfig::default()
    };
    let sim = perplab_core::engine::SimConfig::new(10_000.0, 3.0);
    let report = evaluate_forward(&data(), &descriptors(), &forward, &acceptance, &sim).unwrap();

    assert_eq!(report.splits.len(), 3);
    assert_eq!(report.summary.min_passes, 2);
    for split in &report.splits {
        assert_eq!(split.metrics.len(), 3);
    }
    let passes = |base: &str| {
        report
            .splits
            .iter()
            .filter(|s| s.acceptance.accepted.iter().any(|d| d.base_key() == base))
            .count()
    };
    for d in &report.aggregated {
        assert!(passes(&d.base_key()) >= 2);
    }

    write_forward_artifacts(dir.path(), &report).unwrap();
    for i in 1..=3 {
        let split_dir = dir.path().join(format!("split_{i:02}"));
        assert!(split_dir.join("metrics.csv").exists());
        assert!(split_dir.join("accepted_strategies.json").exists());
    }
    let summary: ForwardSummary = read_json(&dir.path().join("summary.json")).unwrap();
    assert_eq!(summary.per_split_counts.len(), 3);
    assert_eq!(
        load_descriptors(&dir.path().join("accepted_strategies.json"))
            .unwrap()
            .len(),
        report.aggregated.len()
    );
}

#[test]
fn portfolio_then_emit_then_route() {
    let dir = tempfile::tempdir().unwrap();
    let data = data();
    let sim = perplab_core::engine::SimConfig::new(10_000.0, 3.0);
    let config = PortfolioConfig {
        correlation_cap: 1.0,
        ..PortfolioConfig::default()
    };

    // ── Portfolio ──
    let outcome = build_portfolio(&data, &descriptors(), &config, &sim).unwrap();
    let weights = &outcome.selection.weights;
    assert_eq!(weights.len(), 3);
    let total: f64 = weights.values().sum();
    assert!((total - 1.0).abs() < 1e-6);
    assert!(weights
        .values()
        .all(|&w| w >= 0.0 && w <= config.max_weight_per_strategy + 1e-6));
    assert!(outcome.caps.as_ref().unwrap().converged);

    let portfolio_dir = dir.path().join("portfolios");
    write_portfolio_artifacts(&portfolio_dir, &outcome).unwrap();
    let loaded = load_weights(&portfolio_dir.join("selection.json"));
    assert_eq!(&loaded, weights);

    // ── Signals ──
    let book = DescriptorBook::load(&[portfolio_dir.join("selected_strategies.json")]);
    assert_eq!(book.len(), 3);
    let validation = validate_portfolio(&data, &book, &loaded, &config, &sim);
    assert!(validation.passed, "{validation:?}");
    assert!(validation.enb >= 1.0 && validation.enb <= 3.0 + 1e-9);
    let keys: Vec<String> = outcome.selection.selected.clone();
    let feed = SignalFeed::new(dir.path().join("live/signals.csv"));
    let appended = emit_to_feed(&data, &book, &keys, 10_000, &feed).unwrap();
    assert!(appended > 0);
    let signals = feed.read().unwrap().unwrap();
    assert_eq!(signals.len(), appended);

    // ── Router ──
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap());
    let settings = RouterSettings {
        starting_capital: 10_000.0,
        max_leverage: 3.0,
        max_notional: 0.0,
        daily_loss_limit_pct: 0.5,
        use_portfolio_weights: true,
        killswitch_path: dir.path().join("live/KILL"),
    };
    let mut router = Router::open(
        &dir.path().join("live"),
        settings,
        book,
        loaded.clone(),
        clock,
    )
    .unwrap();
    let report = router.process_signals(&signals, &data).unwrap();
    assert_eq!(report.pending, signals.len());
    assert!(report.opened > 0);
    assert_eq!(router.state().processed_signals.len(), signals.len());

    let rows_before = router.ledger().read_all().unwrap().len();
    let again = router.process_signals(&signals, &data).unwrap();
    assert_eq!(again.pending, 0);
    assert_eq!(router.ledger().read_all().unwrap().len(), rows_before);

    router.update_stops(&data).unwrap();
    let equity = router.state().equity;
    assert!(equity.is_finite() && equity > 0.0);
}
