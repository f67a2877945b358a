//! PerpLab CLI: research pipeline and paper execution commands.
//!
//! Commands:
//! - `generate`: seeded MA crossover candidates per market
//! - `backtest`: batch backtest plus acceptance over full history
//! - `forward`: out-of-sample splits and the min-passes vote
//! - `portfolio`: selection, risk-parity weights, cap enforcement
//! - `validate`: re-check the selection and write `validation_report.json`
//! - `emit-signals`: append fresh entry signals to the signal feed
//! - `route`: `update-stops`, `process-signals` or `close-all` on the router
//! - `paper`: weighted replay of the portfolio over recent history, plus the
//!   trade summary when `paper.analyze_trades` is set
//! - `paper-loop`: stops, signals, paper run, sleep; repeated

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use perplab_core::generator::{generate_candidates, GeneratorConfig};
use perplab_runner::acceptance::{apply_acceptance, write_acceptance_artifacts};
use perplab_runner::backtest::{backtest_all, write_backtest_artifacts};
use perplab_runner::emit::emit_to_feed;
use perplab_runner::export::{load_descriptors, save_descriptors, write_json};
use perplab_runner::forward::{evaluate_forward, write_forward_artifacts};
use perplab_runner::paper::{
    run_paper, summarize_trades, write_paper_artifacts, write_trade_summary, PaperStatus,
};
use perplab_runner::portfolio::{
    build_portfolio, intersect_accepted, validate_portfolio, write_portfolio_artifacts,
};
use perplab_runner::router::{DescriptorBook, Router, RouterSettings, SignalFeed, SystemClock};
use perplab_runner::{load_weights, MarketTables, PipelineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "perplab",
    about = "PerpLab CLI: MA crossover research and paper trading for perpetual futures"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate seeded candidate descriptors for every configured market.
    Generate {
        /// Candidates per market.
        #[arg(long, default_value_t = 20)]
        per_market: usize,

        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Backtest a descriptor collection over full history and apply acceptance.
    Backtest {
        /// Descriptor collection. Defaults to the generated candidates.
        #[arg(long)]
        strategies: Option<PathBuf>,
    },
    /// Evaluate descriptors on trailing out-of-sample splits.
    Forward {
        /// Descriptor collection. Defaults to the backtest's accepted set.
        #[arg(long)]
        strategies: Option<PathBuf>,

        /// Override the configured number of splits.
        #[arg(long)]
        splits: Option<usize>,
    },
    /// Build the portfolio from descriptors accepted by backtest and forward.
    Portfolio,
    /// Re-check the persisted selection against caps and correlations.
    Validate,
    /// Detect entry signals for the portfolio and append them to the feed.
    EmitSignals {
        /// Resampled bars inspected per strategy. Defaults to the config value.
        #[arg(long)]
        lookback_bars: Option<usize>,
    },
    /// Router actions against the persisted paper state.
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// Replay the weighted portfolio over recent history.
    Paper {
        /// Trailing days replayed. Defaults to the config value.
        #[arg(long)]
        lookback_days: Option<i64>,
    },
    /// Run stops, signals and the paper replay in a loop.
    PaperLoop {
        /// Number of cycles; 0 runs until interrupted.
        #[arg(long, default_value_t = 0)]
        iterations: u64,

        /// Seconds between cycles. Defaults to the config value.
        #[arg(long)]
        poll_seconds: Option<u64>,
    },
}

#[derive(Subcommand)]
enum RouteAction {
    /// Replay fresh bars against open positions' stops.
    UpdateStops,
    /// Process unhandled signals from the signal feed.
    ProcessSignals,
    /// Close every open position at its latest close.
    CloseAll,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Generate { per_market, seed } => run_generate(&config, per_market, seed),
        Commands::Backtest { strategies } => run_backtest_cmd(&config, strategies),
        Commands::Forward { strategies, splits } => run_forward(&config, strategies, splits),
        Commands::Portfolio => run_portfolio(&config),
        Commands::Validate => run_validate(&config),
        Commands::EmitSignals { lookback_bars } => run_emit(&config, lookback_bars),
        Commands::Route { action } => run_route(&config, action),
        Commands::Paper { lookback_days } => run_paper_cmd(&config, lookback_days),
        Commands::PaperLoop {
            iterations,
            poll_seconds,
        } => run_paper_loop(&config, iterations, poll_seconds),
    }
}

// ─── Research stages ─────────────────────────────────────────────────

fn candidates_path(config: &PipelineConfig) -> PathBuf {
    config.paths.backtests_dir().join("candidates.json")
}

fn load_data(config: &PipelineConfig) -> Result<MarketTables> {
    let data = MarketTables::load(&config.paths.data_dir, &config.markets);
    if data.is_empty() {
        bail!(
            "no price data found in {} for {:?}",
            config.paths.data_dir.display(),
            config.markets
        );
    }
    Ok(data)
}

fn run_generate(config: &PipelineConfig, per_market: usize, seed: u64) -> Result<()> {
    let generator = GeneratorConfig {
        per_market,
        risk_fraction: config.risk.risk_per_trade_target,
        seed,
    };
    let candidates = generate_candidates(&config.markets, &generator)?;
    let path = candidates_path(config);
    save_descriptors(&path, &candidates)?;
    println!("{} candidates → {}", candidates.len(), path.display());
    Ok(())
}

fn run_backtest_cmd(config: &PipelineConfig, strategies: Option<PathBuf>) -> Result<()> {
    let descriptors = match strategies {
        Some(path) => load_descriptors(&path)?,
        None if candidates_path(config).exists() => load_descriptors(&candidates_path(config))?,
        None => {
            info!("no candidate collection, generating with defaults");
            let generator = GeneratorConfig {
                risk_fraction: config.risk.risk_per_trade_target,
                ..GeneratorConfig::default()
            };
            generate_candidates(&config.markets, &generator)?
        }
    };
    let data = load_data(config)?;
    let rows = backtest_all(&data, &descriptors, &config.risk.sim_config());
    let report = apply_acceptance(&rows, &descriptors, &config.acceptance);

    let dir = config.paths.backtests_dir();
    write_backtest_artifacts(&dir, &descriptors, &rows)?;
    write_acceptance_artifacts(&dir, &report)?;
    println!(
        "backtested {} / {} descriptors, {} accepted → {}",
        rows.len(),
        descriptors.len(),
        report.accepted.len(),
        dir.display()
    );
    Ok(())
}

fn run_forward(
    config: &PipelineConfig,
    strategies: Option<PathBuf>,
    splits: Option<usize>,
) -> Result<()> {
    let path = strategies
        .unwrap_or_else(|| config.paths.backtests_dir().join("accepted_strategies.json"));
    let descriptors = load_descriptors(&path)?;
    let mut forward = config.forward;
    if let Some(n) = splits {
        forward.n_splits = n;
    }
    let data = load_data(config)?;
    let report = evaluate_forward(
        &data,
        &descriptors,
        &forward,
        &config.acceptance,
        &config.risk.sim_config(),
    )?;
    let dir = config.paths.forward_dir();
    write_forward_artifacts(&dir, &report)?;
    println!(
        "{} splits, per-split accepted {:?}, {} accepted with ≥{} passes → {}",
        report.summary.splits,
        report.summary.per_split_counts,
        report.summary.accepted_aggregated,
        report.summary.min_passes,
        dir.display()
    );
    Ok(())
}

fn run_portfolio(config: &PipelineConfig) -> Result<()> {
    let backtest = load_descriptors(&config.paths.backtests_dir().join("accepted_strategies.json"))?;
    let forward_path = config.paths.forward_dir().join("accepted_strategies.json");
    let accepted = if forward_path.exists() {
        intersect_accepted(&backtest, &load_descriptors(&forward_path)?)
    } else {
        warn!("no forward results, using backtest acceptance only");
        backtest
    };
    let dir = config.paths.portfolios_dir();
    save_descriptors(&dir.join("accepted_intersection.json"), &accepted)?;

    let data = load_data(config)?;
    let outcome = build_portfolio(&data, &accepted, &config.portfolio, &config.risk.sim_config())?;
    write_portfolio_artifacts(&dir, &outcome)?;
    if let Some(caps) = &outcome.caps {
        write_json(&dir.join("caps.json"), caps)?;
    }

    println!("selected {} of {} accepted:", outcome.selection.selected.len(), accepted.len());
    for (key, w) in &outcome.selection.weights {
        println!("  {key:<40} {w:.4}");
    }
    let m = &outcome.selection.metrics;
    println!(
        "avg month {:.2}%  worst month {:.2}%  max DD {:.2}%",
        m.avg_monthly_return * 100.0,
        m.worst_month * 100.0,
        m.max_drawdown * 100.0
    );
    Ok(())
}

fn run_validate(config: &PipelineConfig) -> Result<()> {
    let selection_path = config.paths.selection_path();
    let weights = load_weights(&selection_path);
    if weights.is_empty() {
        bail!(
            "no weights in {}; run `perplab portfolio` first",
            selection_path.display()
        );
    }
    let data = load_data(config)?;
    let report = validate_portfolio(
        &data,
        &descriptor_book(config),
        &weights,
        &config.portfolio,
        &config.risk.sim_config(),
    );
    let path = config.paths.portfolios_dir().join("validation_report.json");
    write_json(&path, &report)?;

    let v = &report.violations;
    println!(
        "[{}] sum={:.6} | ENB={:.2} | strat_caps_ok={} | market_caps_ok={} | corr_ok={}",
        if report.passed { "PASS" } else { "FAIL" },
        report.sum_weights,
        report.enb,
        v.strategy_weights.is_empty(),
        v.market_caps.is_empty(),
        v.correlations.is_empty()
    );
    for s in &v.strategy_weights {
        println!("  strategy cap: {} {:.4}", s.key, s.weight);
    }
    for m in &v.market_caps {
        println!("  market cap: {} {:.4}", m.market, m.weight);
    }
    for c in &v.correlations {
        println!("  correlation: {} ~ {} r={:.3}", c.a, c.b, c.correlation);
    }
    println!("report → {}", path.display());
    Ok(())
}

// ─── Live stages ─────────────────────────────────────────────────────

fn descriptor_book(config: &PipelineConfig) -> DescriptorBook {
    DescriptorBook::load(&config.paths.descriptor_sources())
}

fn portfolio_weights(config: &PipelineConfig) -> BTreeMap<String, f64> {
    load_weights(&config.paths.selection_path())
}

fn open_router(config: &PipelineConfig) -> Result<Router<SystemClock>> {
    let router = Router::open(
        &config.paths.live_dir(),
        RouterSettings::from_config(config),
        descriptor_book(config),
        portfolio_weights(config),
        SystemClock,
    )?;
    Ok(router)
}

fn run_emit(config: &PipelineConfig, lookback_bars: Option<usize>) -> Result<()> {
    let weights = portfolio_weights(config);
    if weights.is_empty() {
        bail!(
            "no portfolio selection at {}; run `perplab portfolio` first",
            config.paths.selection_path().display()
        );
    }
    let keys: Vec<String> = weights.into_keys().collect();
    let data = load_data(config)?;
    let feed = SignalFeed::new(config.paths.signals_path());
    let appended = emit_to_feed(
        &data,
        &descriptor_book(config),
        &keys,
        lookback_bars.unwrap_or(config.live.signal_lookback_bars),
        &feed,
    )?;
    println!("{appended} new signals → {}", feed.path().display());
    Ok(())
}

fn process_feed(router: &mut Router<SystemClock>, feed: &SignalFeed, data: &MarketTables) -> Result<()> {
    let Some(signals) = feed.read()? else {
        feed.touch()?;
        info!(feed = %feed.path().display(), "signal feed created, nothing to process");
        return Ok(());
    };
    let report = router.process_signals(&signals, data)?;
    println!(
        "pending {}  opened {}  flipped {}  tightened {}  skipped {}  blocked {}",
        report.pending,
        report.opened,
        report.flipped,
        report.tightened,
        report.skipped,
        report.blocked
    );
    Ok(())
}

fn print_state(router: &Router<SystemClock>) {
    let state = router.state();
    println!(
        "equity {:.2}  open {}  realized today {:.2}  kill-switch {}",
        state.equity,
        state.positions.len(),
        state.realized_today,
        if router.killswitch().is_active() { "ON" } else { "off" }
    );
}

fn run_route(config: &PipelineConfig, action: RouteAction) -> Result<()> {
    let data = load_data(config)?;
    let mut router = open_router(config)?;
    match action {
        RouteAction::UpdateStops => {
            let report = router.update_stops(&data)?;
            println!(
                "checked {}  stopped {}{}",
                report.checked,
                report.stopped,
                if report.killswitch { "  KILL-SWITCH TRIPPED" } else { "" }
            );
        }
        RouteAction::ProcessSignals => {
            process_feed(&mut router, &SignalFeed::new(config.paths.signals_path()), &data)?;
        }
        RouteAction::CloseAll => {
            let closed = router.close_all(&data, "MANUAL")?;
            println!("closed {closed} positions");
        }
    }
    print_state(&router);
    Ok(())
}

fn paper_once(config: &PipelineConfig, data: &MarketTables, lookback_days: i64) -> Result<()> {
    let report = run_paper(
        data,
        &descriptor_book(config),
        &portfolio_weights(config),
        lookback_days,
        &config.risk.sim_config(),
    );
    let dir = config.paths.paper_dir();
    write_paper_artifacts(&dir, &report)?;
    if config.paper.analyze_trades && report.meta.status == PaperStatus::Ok {
        write_trade_summary(&dir, &summarize_trades(&report.trades))?;
    }
    println!(
        "paper run {:?}: {} strategies, {} trades, equity {:.2}",
        report.meta.status,
        report.meta.used.len(),
        report.trades.len(),
        report.equity.last().unwrap_or(config.risk.starting_capital)
    );
    Ok(())
}

fn run_paper_cmd(config: &PipelineConfig, lookback_days: Option<i64>) -> Result<()> {
    let data = load_data(config)?;
    paper_once(config, &data, lookback_days.unwrap_or(config.paper.lookback_days))
}

/// One cycle: reload bars, update stops, process the feed, paper replay.
/// The router is reopened per cycle so its lock is free while sleeping.
fn loop_cycle(config: &PipelineConfig) -> Result<()> {
    let data = load_data(config)?;
    {
        let mut router = open_router(config)?;
        router.update_stops(&data)?;
        process_feed(&mut router, &SignalFeed::new(config.paths.signals_path()), &data)?;
        print_state(&router);
    }
    paper_once(config, &data, config.paper.lookback_days)
}

fn run_paper_loop(config: &PipelineConfig, iterations: u64, poll_seconds: Option<u64>) -> Result<()> {
    let poll = Duration::from_secs(poll_seconds.unwrap_or(config.paper.poll_seconds));
    let mut cycle = 0u64;
    loop {
        cycle += 1;
        info!(cycle, "paper loop cycle");
        if let Err(e) = loop_cycle(config) {
            warn!(cycle, error = %format!("{e:#}"), "cycle failed");
        }
        if iterations > 0 && cycle >= iterations {
            return Ok(());
        }
        thread::sleep(poll);
    }
}
