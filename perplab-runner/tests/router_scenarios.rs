//! End-to-end router scenarios against on-disk state.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use perplab_core::data::PriceTable;
use perplab_core::domain::{Bar, Market, RawDescriptor, StrategyDescriptor, Timeframe};
use perplab_core::signals::{EntrySignal, SignalAction};
use perplab_runner::market_data::MarketTables;
use perplab_runner::router::{
    DescriptorBook, LedgerEvent, LoadStatus, ManualClock, Router, RouterError, RouterSettings,
    RouterState, SignalFeed, StateStore,
};

// ── Fixtures ──

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn descriptor() -> StrategyDescriptor {
    let mut raw = RawDescriptor::new("BTCUSDT", 3, 5, 0.02, 0.01);
    raw.timeframe = "1m".into();
    StrategyDescriptor::try_from(raw).unwrap()
}

fn table(closes: &[f64]) -> PriceTable {
    let bars = closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Bar {
                time: t0() + Duration::minutes(i as i64),
                open,
                high: open.max(close) + 0.5,
                low: open.min(close) - 0.5,
                close,
                volume: 1.0,
                funding: None,
            }
        })
        .collect();
    PriceTable::new(bars).unwrap()
}

fn flat_data() -> MarketTables {
    let mut data = MarketTables::new();
    data.insert(Market::Btcusdt, table(&[100.0; 10]));
    data
}

fn settings(dir: &Path) -> RouterSettings {
    RouterSettings {
        starting_capital: 10_000.0,
        max_leverage: 3.0,
        max_notional: 0.0,
        daily_loss_limit_pct: 0.02,
        use_portfolio_weights: true,
        killswitch_path: dir.join("KILL"),
    }
}

fn signal(minute: i64, action: SignalAction, price: f64, stop: f64) -> EntrySignal {
    EntrySignal {
        time: t0() + Duration::minutes(minute),
        symbol: Market::Btcusdt,
        timeframe: Timeframe::M1,
        action,
        price,
        stop_price: stop,
        strategy_key: descriptor().key(),
    }
}

fn open_router(
    dir: &Path,
    weights: BTreeMap<String, f64>,
    clock: ManualClock,
) -> Router<ManualClock> {
    Router::open(
        &dir.join("live"),
        settings(dir),
        DescriptorBook::new([descriptor()]),
        weights,
        clock,
    )
    .unwrap()
}

fn clock() -> ManualClock {
    ManualClock::new(t0() + Duration::hours(1))
}

// ── Idempotence ──

#[test]
fn replaying_signals_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let data = flat_data();
    let signals = vec![signal(2, SignalAction::EntryLong, 100.0, 98.0)];

    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    let first = router.process_signals(&signals, &data).unwrap();
    assert_eq!(first.opened, 1);
    let state_after_first = router.state().clone();
    let rows_after_first = router.ledger().read_all().unwrap().len();

    let second = router.process_signals(&signals, &data).unwrap();
    assert_eq!(second.pending, 0);
    assert_eq!(router.state(), &state_after_first);
    assert_eq!(router.ledger().read_all().unwrap().len(), rows_after_first);
    drop(router);

    // Idempotent across process restarts too.
    let mut reopened = open_router(dir.path(), BTreeMap::new(), clock());
    assert_eq!(reopened.load_status(), LoadStatus::Loaded);
    assert_eq!(reopened.process_signals(&signals, &data).unwrap().pending, 0);
    assert_eq!(reopened.state(), &state_after_first);
}

#[test]
fn processed_ids_outlive_day_rollovers() {
    let dir = tempfile::tempdir().unwrap();
    let data = flat_data();
    let signals = vec![signal(2, SignalAction::EntryLong, 100.0, 98.0)];
    let clock = clock();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock.clone());
    router.process_signals(&signals, &data).unwrap();
    drop(router);

    clock.set(t0() + Duration::days(30));
    let mut reopened = open_router(dir.path(), BTreeMap::new(), clock);
    assert_eq!(reopened.process_signals(&signals, &data).unwrap().pending, 0);
    assert_eq!(reopened.state().processed_signals.len(), 1);
}

#[test]
fn duplicate_ids_in_one_batch_count_once() {
    let dir = tempfile::tempdir().unwrap();
    let s = signal(2, SignalAction::EntryLong, 100.0, 98.0);
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    let report = router.process_signals(&[s.clone(), s], &flat_data()).unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(router.state().processed_signals.len(), 1);
}

// ── Sizing ──

#[test]
fn half_weight_opens_half_the_notional() {
    let data = flat_data();
    let signals = vec![signal(2, SignalAction::EntryLong, 100.0, 98.0)];

    let full_dir = tempfile::tempdir().unwrap();
    let mut full = open_router(full_dir.path(), BTreeMap::new(), clock());
    full.process_signals(&signals, &data).unwrap();

    let half_dir = tempfile::tempdir().unwrap();
    let weights = BTreeMap::from([(descriptor().key(), 0.5)]);
    let mut half = open_router(half_dir.path(), weights, clock());
    half.process_signals(&signals, &data).unwrap();

    let key = descriptor().key();
    let q_full = full.state().positions[&key].position.quantity();
    let q_half = half.state().positions[&key].position.quantity();
    assert!((q_half / q_full - 0.5).abs() < 1e-9, "{q_half} vs {q_full}");
}

#[test]
fn max_notional_caps_the_position() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = settings(dir.path());
    s.max_notional = 1_000.0;
    let mut router = Router::open(
        &dir.path().join("live"),
        s,
        DescriptorBook::new([descriptor()]),
        BTreeMap::new(),
        clock(),
    )
    .unwrap();
    let sig = signal(2, SignalAction::EntryLong, 100.0, 98.0);
    router.process_signals(&[sig], &flat_data()).unwrap();
    let pos = &router.state().positions[&descriptor().key()].position;
    assert!((pos.notional(pos.entry_price()) - 1_000.0).abs() < 1e-6);
}

// ── Position lifecycle ──

#[test]
fn stop_breach_closes_and_books_the_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = MarketTables::new();
    data.insert(
        Market::Btcusdt,
        table(&[100.0, 100.0, 100.0, 99.5, 99.0, 97.0, 96.0]),
    );

    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    router
        .process_signals(&[signal(2, SignalAction::EntryLong, 100.0, 98.0)], &data)
        .unwrap();
    let equity_after_entry = router.state().equity;

    let report = router.update_stops(&data).unwrap();
    assert_eq!(report.stopped, 1);
    assert!(!report.killswitch);
    assert!(router.state().positions.is_empty());
    assert!(router.state().equity < equity_after_entry);

    let rows = router.ledger().read_all().unwrap();
    let stop = rows.iter().find(|r| r.event == LedgerEvent::CloseStop).unwrap();
    assert_eq!(stop.reason, "STOP");
    let expected_fill = 98.0 * (1.0 - descriptor().slippage());
    assert!((stop.price.unwrap() - expected_fill).abs() < 1e-9);
    assert_eq!(stop.time, t0() + Duration::minutes(5));
}

#[test]
fn quiet_bars_advance_the_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let data = flat_data();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    router
        .process_signals(&[signal(2, SignalAction::EntryLong, 100.0, 98.0)], &data)
        .unwrap();

    let report = router.update_stops(&data).unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.stopped, 0);
    let tracked = &router.state().positions[&descriptor().key()];
    assert_eq!(tracked.last_checked, Some(t0() + Duration::minutes(9)));
}

#[test]
fn opposite_signal_flips_flat() {
    let dir = tempfile::tempdir().unwrap();
    let data = flat_data();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    let report = router
        .process_signals(
            &[
                signal(2, SignalAction::EntryLong, 100.0, 98.0),
                signal(4, SignalAction::EntryShort, 101.0, 103.0),
            ],
            &data,
        )
        .unwrap();
    assert_eq!((report.opened, report.flipped), (1, 1));
    assert!(router.state().positions.is_empty());

    let events: Vec<LedgerEvent> = router
        .ledger()
        .read_all()
        .unwrap()
        .iter()
        .map(|r| r.event)
        .collect();
    assert_eq!(events, vec![LedgerEvent::Open, LedgerEvent::CloseFlip]);
}

#[test]
fn same_side_signal_only_tightens() {
    let dir = tempfile::tempdir().unwrap();
    let data = flat_data();
    let key = descriptor().key();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    router
        .process_signals(&[signal(2, SignalAction::EntryLong, 100.0, 98.0)], &data)
        .unwrap();
    let qty = router.state().positions[&key].position.quantity();

    // Looser stop is ignored, tighter one is taken.
    let looser = router
        .process_signals(&[signal(3, SignalAction::EntryLong, 100.0, 97.0)], &data)
        .unwrap();
    assert_eq!(looser.tightened, 0);
    assert_eq!(router.state().positions[&key].position.stop_price(), 98.0);

    let tighter = router
        .process_signals(&[signal(4, SignalAction::EntryLong, 100.0, 99.0)], &data)
        .unwrap();
    assert_eq!(tighter.tightened, 1);
    let pos = &router.state().positions[&key].position;
    assert_eq!(pos.stop_price(), 99.0);
    assert_eq!(pos.quantity(), qty);
}

#[test]
fn unresolvable_signal_is_marked_processed() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = signal(2, SignalAction::EntryLong, 100.0, 98.0);
    s.strategy_key = "SOLUSDT|f3|s5|sl0.0200|1m".into();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    let report = router.process_signals(&[s], &flat_data()).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(router.state().processed_signals.len(), 1);
    assert!(router.state().positions.is_empty());
}

#[test]
fn malformed_feed_row_does_not_block_valid_entries() {
    let dir = tempfile::tempdir().unwrap();
    let feed = SignalFeed::new(dir.path().join("live/signals.csv"));
    let good = signal(2, SignalAction::EntryLong, 100.0, 98.0);
    feed.append_new(&[good]).unwrap();
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(feed.path())
        .unwrap();
    writeln!(
        file,
        "2024-03-01T00:03:00Z,XRPUSDT,1m,entry_long,0.5,0.49,XRPUSDT|f3|s5|sl0.0200|1m"
    )
    .unwrap();
    drop(file);

    let signals = feed.read().unwrap().unwrap();
    assert_eq!(signals.len(), 1);
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    let report = router.process_signals(&signals, &flat_data()).unwrap();
    assert_eq!(report.opened, 1);
}

#[test]
fn base_key_resolves_timeframe_override() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = signal(2, SignalAction::EntryLong, 100.0, 98.0);
    s.strategy_key = format!("{}|5m", descriptor().base_key());
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    let report = router.process_signals(&[s], &flat_data()).unwrap();
    assert_eq!(report.opened, 1);
}

// ── Daily loss limit ──

fn seeded_state(dir: &Path, realized_today: f64) {
    let mut state = RouterState::fresh(10_000.0, t0().date_naive());
    state.realized_today = realized_today;
    state.equity = 10_000.0 + realized_today;
    let store = StateStore::open(&dir.join("live/state.json")).unwrap();
    store.save(&state).unwrap();
}

#[test]
fn daily_limit_trips_exactly_at_threshold() {
    let dir = tempfile::tempdir().unwrap();
    seeded_state(dir.path(), -200.0);
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    assert!(router.check_daily_limit(&flat_data()).unwrap());
    assert!(router.killswitch().is_active());
    let rows = router.ledger().read_all().unwrap();
    assert_eq!(rows.last().unwrap().event, LedgerEvent::Killswitch);
}

#[test]
fn daily_limit_holds_one_cent_above() {
    let dir = tempfile::tempdir().unwrap();
    seeded_state(dir.path(), -199.99);
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    assert!(!router.check_daily_limit(&flat_data()).unwrap());
    assert!(!router.killswitch().is_active());
}

#[test]
fn killswitch_blocks_and_consumes_signals() {
    let dir = tempfile::tempdir().unwrap();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock());
    router.killswitch().trip().unwrap();

    let signals = vec![
        signal(2, SignalAction::EntryLong, 100.0, 98.0),
        signal(3, SignalAction::EntryShort, 100.0, 102.0),
    ];
    let report = router.process_signals(&signals, &flat_data()).unwrap();
    assert_eq!(report.blocked, 2);
    assert!(router.state().positions.is_empty());
    assert_eq!(router.process_signals(&signals, &flat_data()).unwrap().pending, 0);
}

#[test]
fn limit_breach_force_closes_open_positions() {
    let dir = tempfile::tempdir().unwrap();
    // Position opened at 100, market now at 90: a large mark-to-market loss.
    let mut closes = vec![100.0; 4];
    closes.extend([95.0, 90.0]);
    let mut data = MarketTables::new();
    data.insert(Market::Btcusdt, table(&closes));

    let mut s = settings(dir.path());
    s.daily_loss_limit_pct = 0.01;
    let mut router = Router::open(
        &dir.path().join("live"),
        s,
        DescriptorBook::new([descriptor()]),
        BTreeMap::new(),
        clock(),
    )
    .unwrap();
    // Stops are never replayed here, so only the loss limit can close it.
    router
        .process_signals(&[signal(3, SignalAction::EntryLong, 100.0, 95.0)], &data)
        .unwrap();
    assert_eq!(router.state().positions.len(), 1);

    assert!(router.check_daily_limit(&data).unwrap());
    assert!(router.state().positions.is_empty());
    let rows = router.ledger().read_all().unwrap();
    let close = rows.iter().find(|r| r.event == LedgerEvent::CloseAll).unwrap();
    assert_eq!(close.price, Some(90.0));
    assert_eq!(close.reason, "DAILY_LIMIT");
}

// ── Day rollover ──

#[test]
fn rollover_happens_once_per_date() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let data = flat_data();
    let mut router = open_router(dir.path(), BTreeMap::new(), clock.clone());
    router.update_stops(&data).unwrap();

    clock.set(t0() + Duration::days(1) + Duration::hours(2));
    router.update_stops(&data).unwrap();
    router.update_stops(&data).unwrap();
    router.process_signals(&[], &data).unwrap();

    let rollovers = router
        .ledger()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|r| r.event == LedgerEvent::DayRollover)
        .count();
    assert_eq!(rollovers, 1);
    assert_eq!(
        router.state().day_tag,
        NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
    );
}

#[test]
fn rollover_resets_daily_counters_on_open() {
    let dir = tempfile::tempdir().unwrap();
    seeded_state(dir.path(), -150.0);
    let next_day = ManualClock::new(t0() + Duration::days(1));
    let router = open_router(dir.path(), BTreeMap::new(), next_day);
    assert_eq!(router.state().realized_today, 0.0);
    assert_eq!(router.state().day_start_equity, 9_850.0);
}

// ── Persistence ──

#[test]
fn second_router_on_same_state_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let first = open_router(dir.path(), BTreeMap::new(), clock());
    let second = Router::open(
        &dir.path().join("live"),
        settings(dir.path()),
        DescriptorBook::new([descriptor()]),
        BTreeMap::new(),
        clock(),
    );
    assert!(matches!(second, Err(RouterError::Locked { .. })));
    drop(first);
    let _third = open_router(dir.path(), BTreeMap::new(), clock());
}

#[test]
fn corrupt_state_restarts_from_capital() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("live")).unwrap();
    std::fs::write(dir.path().join("live/state.json"), "{\"equity\": 5").unwrap();
    let router = open_router(dir.path(), BTreeMap::new(), clock());
    assert_eq!(router.load_status(), LoadStatus::Recovered);
    assert_eq!(router.state().equity, 10_000.0);
    assert!(dir.path().join("live/state.json.corrupt").exists());
}
