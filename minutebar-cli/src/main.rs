//! minutebar CLI: ingestion loop and read-side queries.
//!
//! Commands:
//! - `poll`: run the ingestion poll loop against the configured feed
//! - `snapshot`: print the last N bars per symbol as JSON
//! - `window`: show the session window a cycle would request
//! - `status`: per-symbol row counts and time ranges in the store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use minutebar_core::session::MarketCalendar;
use minutebar_core::snapshot::snapshot_at;
use minutebar_core::store::{BarStore, StoreOptions};
use minutebar_runner::{IngestConfig, Poller};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minutebar", about = "minutebar: minute-bar ingestion and snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feed and upsert minute bars into the store.
    Poll {
        /// Optional TOML config file. Environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run a single cycle and exit.
        #[arg(long, default_value_t = false, conflicts_with = "cycles")]
        once: bool,

        /// Stop after this many cycles. Runs forever when omitted.
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Print the most recent bars per symbol as JSON.
    Snapshot {
        /// Symbols to include (case-insensitive).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Bars per symbol.
        #[arg(long, default_value_t = 60)]
        window: usize,

        /// Store file. Defaults to DB_PATH or store/market.sqlite.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Pretty-print the JSON.
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
    /// Show the session window for an instant (default: now).
    Window {
        /// RFC 3339 instant, e.g. 2024-03-05T15:00:00Z.
        #[arg(long)]
        at: Option<String>,
    },
    /// Report stored symbols, row counts and time ranges.
    Status {
        /// Store file. Defaults to DB_PATH or store/market.sqlite.
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Poll {
            config,
            once,
            cycles,
        } => run_poll(config.as_deref(), if once { Some(1) } else { cycles }),
        Commands::Snapshot {
            symbols,
            window,
            db,
            pretty,
        } => run_snapshot(&symbols, window, db, pretty),
        Commands::Window { at } => run_window(at.as_deref()),
        Commands::Status { db } => run_status(db),
    }
}

/// Logs go to stderr so `snapshot` output stays clean JSON on stdout.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn run_poll(config_path: Option<&Path>, max_cycles: Option<u64>) -> Result<()> {
    let config = IngestConfig::load(config_path).context("loading configuration")?;
    let mut poller = Poller::from_config(&config).context("starting poll loop")?;
    poller.run(max_cycles);
    Ok(())
}

fn run_snapshot(symbols: &[String], window: usize, db: Option<PathBuf>, pretty: bool) -> Result<()> {
    let db_path = resolve_db(db)?;
    let snap = snapshot_at(&db_path, symbols, window)
        .with_context(|| format!("reading snapshot from {}", db_path.display()))?;
    println!("{}", snap.to_json_string(pretty)?);
    Ok(())
}

fn run_window(at: Option<&str>) -> Result<()> {
    let now = match at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid --at instant '{raw}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let calendar = MarketCalendar::us_equities();
    let window = calendar.window_for(now);

    println!("As of:  {}", now.to_rfc3339());
    println!(
        "Open:   {}  ({})",
        window.open.to_rfc3339(),
        window.open.with_timezone(&calendar.tz).format("%a %Y-%m-%d %H:%M %Z")
    );
    println!(
        "Close:  {}  ({})",
        window.close.to_rfc3339(),
        window.close.with_timezone(&calendar.tz).format("%a %Y-%m-%d %H:%M %Z")
    );
    println!(
        "Status: {}",
        if window.partial { "session in progress" } else { "last completed session" }
    );
    Ok(())
}

fn run_status(db: Option<PathBuf>) -> Result<()> {
    let db_path = resolve_db(db)?;
    if !db_path.exists() {
        println!("Store does not exist: {}", db_path.display());
        return Ok(());
    }

    let store = BarStore::open_read_only(&db_path, StoreOptions::default())
        .with_context(|| format!("opening {}", db_path.display()))?;
    if !store.has_schema()? {
        println!("Store has no bar table yet: {}", db_path.display());
        return Ok(());
    }

    let stats = store.symbols()?;
    if stats.is_empty() {
        println!("Store is empty: {}", db_path.display());
        return Ok(());
    }

    println!("Store: {}", db_path.display());
    println!("{:<10} {:>8}  {:<25}  {:<25}", "Symbol", "Bars", "First", "Last");
    println!("{}", "-".repeat(72));
    let mut total = 0;
    for s in &stats {
        println!("{:<10} {:>8}  {:<25}  {:<25}", s.symbol, s.rows, s.first, s.last);
        total += s.rows;
    }
    println!("{}", "-".repeat(72));
    println!("{} symbols, {total} bars", stats.len());
    Ok(())
}

/// Explicit `--db`, else the configured store path (DB_PATH or default).
fn resolve_db(db: Option<PathBuf>) -> Result<PathBuf> {
    match db {
        Some(path) => Ok(path),
        None => Ok(IngestConfig::load(None)
            .context("loading configuration")?
            .db_path),
    }
}
