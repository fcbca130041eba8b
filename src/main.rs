mod config;
mod error;
mod replay;
mod rpc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use clap::{Parser, Subcommand};
use referral_tracker::web3::{format_address, parse_address};
use referral_tracker::{
    Clock, CountCache, CountSource, EventSource, JsonFileCache, ReferralCount, ReferralTracker,
    SystemClock, TrackOutcome, TrackerError,
};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::AppConfig;
use crate::error::CliError;
use crate::rpc::JsonRpcEventSource;

/// Longest the watch loop sleeps between timer checks.
const MAX_IDLE: Duration = Duration::from_millis(1_000);

#[derive(Parser)]
#[command(name = "referpay", version, about = "Track ReferPay referral payouts on Polygon")]
struct Cli {
    /// JSON config file; missing keys keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the config file and REFERPAY_RPC_URL.
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    #[arg(long, global = true)]
    cache_file: Option<PathBuf>,

    /// -v info, -vv debug, -vvv trace.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow an account live and print the count whenever it changes.
    Watch {
        #[arg(long, value_parser = parse_account)]
        account: Address,
        /// Stop after this many seconds; runs until interrupted otherwise.
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Backfill once, print and cache the count.
    Count {
        #[arg(long, value_parser = parse_account)]
        account: Address,
    },
    /// Feed recorded transfers (JSON lines) through an in-memory chain.
    Replay {
        events: PathBuf,
        #[arg(long, value_parser = parse_account)]
        account: Address,
        /// Records at or below this block are history.
        #[arg(long)]
        head: u64,
    },
    /// Inspect the on-disk count cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Show {
        #[arg(long, value_parser = parse_account)]
        account: Address,
    },
    Clear {
        #[arg(long, value_parser = parse_account)]
        account: Address,
    },
}

fn parse_account(input: &str) -> Result<Address, TrackerError> {
    parse_address(input)
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already installed");
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, CliError> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(url) = &cli.rpc_url {
        config.rpc_url = url.clone();
    }
    if let Some(path) = &cli.cache_file {
        config.cache_file = path.clone();
    }
    debug!(?config, "configuration loaded");
    Ok(config)
}

fn source_label(source: CountSource) -> &'static str {
    match source {
        CountSource::Empty => "empty",
        CountSource::Provisional => "provisional",
        CountSource::Confirmed => "confirmed",
        CountSource::Degraded => "degraded",
    }
}

fn print_count(account: &Address, count: ReferralCount) {
    println!(
        "{}  referrals={}  ({})",
        format_address(account),
        count.value,
        source_label(count.source)
    );
}

fn build_tracker(config: &AppConfig) -> Result<ReferralTracker, CliError> {
    let source: Arc<dyn EventSource> = Arc::new(JsonRpcEventSource::connect(config)?);
    Ok(ReferralTracker::new(
        config.tracker_settings(),
        Some(source),
        Box::new(JsonFileCache::new(&config.cache_file)),
        Arc::new(SystemClock),
    ))
}

fn watch(
    config: &AppConfig,
    account: Address,
    duration: Option<Duration>,
) -> Result<(), CliError> {
    let mut tracker = build_tracker(config)?;
    let outcome = tracker.track(account)?;
    let mut shown = tracker.count();
    if shown.source != CountSource::Empty {
        print_count(&account, shown);
    }
    // the backfill thread is detached; its report arrives through the inbox
    let _worker = outcome
        .into_backfill()
        .and_then(|job| tracker.spawn_backfill(job));

    let stop_at = duration.map(|d| Instant::now() + d);
    info!(account = %format_address(&account), "watching for referral payouts");
    loop {
        if stop_at.map_or(false, |at| Instant::now() >= at) {
            break;
        }
        let now = SystemClock.now_ms();
        let wait = tracker
            .next_wakeup()
            .map_or(MAX_IDLE, |at| Duration::from_millis(at.saturating_sub(now)))
            .min(MAX_IDLE);
        tracker.wait_inbox(wait);
        tracker.poll_timers();

        let count = tracker.count();
        if count.value != shown.value || count.source != shown.source {
            print_count(&account, count);
            shown = count;
        }
    }
    tracker.reset();
    Ok(())
}

fn count(config: &AppConfig, account: Address) -> Result<(), CliError> {
    let mut tracker = build_tracker(config)?;
    if let TrackOutcome::Started { backfill, .. } = tracker.track(account)? {
        tracker.backfill_now(backfill);
    }
    print_count(&account, tracker.count());
    tracker.reset();
    Ok(())
}

fn run_replay(
    config: &AppConfig,
    events: &Path,
    account: Address,
    head: u64,
) -> Result<(), CliError> {
    let records = replay::read_records(events)?;
    let summary = replay::replay(&records, account, head, config.tracker_settings())?;
    for (at_ms, value) in &summary.updates {
        println!("t+{at_ms}ms  referrals={value}");
    }
    println!("history={} live={}", summary.history, summary.live);
    print_count(&account, summary.final_count);
    Ok(())
}

fn cache(config: &AppConfig, action: &CacheAction) -> Result<(), CliError> {
    let mut cache = JsonFileCache::new(&config.cache_file);
    match action {
        CacheAction::Show { account } => match cache.get(account) {
            Some(entry) => {
                let now = SystemClock.now_ms();
                let ttl_ms = config.cache_ttl_secs.saturating_mul(1_000);
                let state = if entry.is_fresh(now, ttl_ms) { "fresh" } else { "expired" };
                println!(
                    "{}  referrals={}  age={}s  {state}",
                    format_address(account),
                    entry.count,
                    now.saturating_sub(entry.timestamp) / 1_000,
                );
            }
            None => println!("{}  no cache entry", format_address(account)),
        },
        CacheAction::Clear { account } => {
            cache.remove(account);
            println!("{}  cache entry removed", format_address(account));
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;
    match &cli.command {
        Command::Watch {
            account,
            duration_secs,
        } => watch(&config, *account, duration_secs.map(Duration::from_secs)),
        Command::Count { account } => count(&config, *account),
        Command::Replay {
            events,
            account,
            head,
        } => run_replay(&config, events, *account, *head),
        Command::Cache { action } => cache(&config, action),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}
