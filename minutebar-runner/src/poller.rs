//! Poll loop: window → fetch → normalize → upsert, once per interval.
//!
//! Two states, `Idle` and `Cycle`. A cycle always ends back in `Idle` with a
//! typed `CycleOutcome`; no failure inside a cycle stops the loop. The next
//! scheduled cycle is the retry.

use crate::config::{ConfigError, IngestConfig};
use chrono::{DateTime, Utc};
use minutebar_core::data::{
    AlpacaFeed, BarFeed, BarRequest, CircuitBreaker, DataError, FeedTier, Normalizer,
};
use minutebar_core::session::{MarketCalendar, SessionWindow};
use minutebar_core::store::{BarStore, StoreError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Cycle,
}

/// Failure classes a cycle can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Feed unreachable.
    Network,
    /// HTTP 429 or breaker still cooling down.
    RateLimited,
    /// Feed answered, but not with bars (auth, 5xx, undecodable body).
    Upstream,
    /// Table missing a required field after alias resolution.
    Shape,
    /// Store stayed locked past the wait timeout.
    StoreBusy,
    Store,
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Success { rows: usize },
    /// Nothing came back for the window. Not an error.
    Empty,
    Failure { kind: FailureKind, message: String },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failure { .. })
    }
}

/// Anything that can abort a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CycleError::Data(e) => match e {
                DataError::NetworkUnreachable(_) => FailureKind::Network,
                DataError::RateLimited { .. } | DataError::CircuitBreakerTripped => {
                    FailureKind::RateLimited
                }
                DataError::MissingFields { .. } | DataError::Table(_) => FailureKind::Shape,
                DataError::AuthenticationRequired(_)
                | DataError::Http { .. }
                | DataError::ResponseFormatChanged(_)
                | DataError::Client(_) => FailureKind::Upstream,
            },
            CycleError::Store(StoreError::Busy(_)) => FailureKind::StoreBusy,
            CycleError::Store(_) => FailureKind::Store,
        }
    }
}

/// Errors building a poller from configuration.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("feed error: {0}")]
    Feed(#[from] DataError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// One completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: SessionWindow,
    pub outcome: CycleOutcome,
}

/// Bounded in-memory history of cycle reports, oldest evicted first.
#[derive(Debug, Clone)]
pub struct CycleLog {
    capacity: usize,
    entries: VecDeque<CycleReport>,
}

impl CycleLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, report: CycleReport) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(report);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&CycleReport> {
        self.entries.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &CycleReport> {
        self.entries.iter()
    }

    /// Failed cycles among those retained.
    pub fn failures(&self) -> usize {
        self.entries.iter().filter(|r| r.outcome.is_failure()).count()
    }
}

/// Receives every finished cycle.
pub trait CycleReporter: Send {
    fn on_cycle(&self, report: &CycleReport);
}

/// Reports cycles as tracing events.
pub struct TracingReporter;

impl CycleReporter for TracingReporter {
    fn on_cycle(&self, report: &CycleReport) {
        let elapsed_ms = (report.finished_at - report.started_at).num_milliseconds();
        match &report.outcome {
            CycleOutcome::Success { rows } => {
                tracing::info!(rows, window = %report.window, elapsed_ms, "upserted bars");
            }
            CycleOutcome::Empty => {
                tracing::info!(window = %report.window, "no bars returned for window");
            }
            CycleOutcome::Failure { kind, message } => match kind {
                FailureKind::Shape | FailureKind::Store => {
                    tracing::error!(?kind, error = %message, window = %report.window, "cycle failed");
                }
                _ => {
                    tracing::warn!(?kind, error = %message, window = %report.window, "cycle failed; retrying next cycle");
                }
            },
        }
    }
}

/// The ingestion loop. Sole writer of its store.
pub struct Poller {
    feed: Box<dyn BarFeed>,
    store: BarStore,
    calendar: MarketCalendar,
    symbols: Vec<String>,
    feed_tier: FeedTier,
    row_limit: usize,
    interval: Duration,
    state: LoopState,
    log: CycleLog,
    reporter: Box<dyn CycleReporter>,
}

impl Poller {
    /// Poller over an explicit feed and store. `config` must be validated.
    pub fn new(feed: Box<dyn BarFeed>, store: BarStore, config: &IngestConfig) -> Self {
        Self {
            feed,
            store,
            calendar: MarketCalendar::us_equities(),
            symbols: config.symbols.clone(),
            feed_tier: config.feed,
            row_limit: config.row_limit,
            interval: config.poll_interval(),
            state: LoopState::Idle,
            log: CycleLog::new(config.log_capacity),
            reporter: Box::new(TracingReporter),
        }
    }

    /// Alpaca feed plus the configured store file.
    pub fn from_config(config: &IngestConfig) -> Result<Self, StartupError> {
        let credentials = config.require_credentials()?.clone();
        let breaker = Arc::new(CircuitBreaker::default_provider());
        let feed = AlpacaFeed::new(credentials, config.base_url.clone(), breaker)?;
        let store = BarStore::open_with(&config.db_path, config.store_options())?;
        Ok(Self::new(Box::new(feed), store, config))
    }

    pub fn with_reporter(mut self, reporter: Box<dyn CycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_calendar(mut self, calendar: MarketCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn log(&self) -> &CycleLog {
        &self.log
    }

    pub fn store(&self) -> &BarStore {
        &self.store
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Run one cycle as of `now` and return to `Idle`.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.state = LoopState::Cycle;

        let window = self.calendar.window_for(now);
        let outcome = match self.ingest(&window) {
            Ok(0) => CycleOutcome::Empty,
            Ok(rows) => CycleOutcome::Success { rows },
            Err(e) => CycleOutcome::Failure {
                kind: e.kind(),
                message: e.to_string(),
            },
        };

        self.state = LoopState::Idle;

        let report = CycleReport {
            started_at: now,
            finished_at: Utc::now().max(now),
            window,
            outcome,
        };
        self.reporter.on_cycle(&report);
        self.log.push(report.clone());
        report
    }

    /// Cycle, sleep, repeat. Sleep starts when the previous cycle ends.
    ///
    /// With `max_cycles == None` this never returns. `Some(0)` runs nothing.
    pub fn run(&mut self, max_cycles: Option<u64>) {
        if max_cycles == Some(0) {
            return;
        }

        tracing::info!(
            symbols = ?self.symbols,
            feed = self.feed.name(),
            tier = self.feed_tier.as_str(),
            interval_secs = self.interval.as_secs(),
            db = %self.store.path().display(),
            "poll loop started"
        );

        let mut completed: u64 = 0;
        loop {
            self.run_cycle(Utc::now());
            completed += 1;
            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }
            std::thread::sleep(self.interval);
        }

        tracing::info!(
            cycles = completed,
            failures = self.log.failures(),
            "poll loop finished"
        );
    }

    fn ingest(&mut self, window: &SessionWindow) -> Result<usize, CycleError> {
        let request = BarRequest {
            symbols: self.symbols.clone(),
            start: window.open,
            end: window.close,
            feed: self.feed_tier,
            limit: self.row_limit,
        };

        if !self.feed.is_available() {
            return Err(DataError::CircuitBreakerTripped.into());
        }
        let pages = self.feed.fetch_bars(&request)?;
        for page in &pages {
            tracing::debug!(summary = %page.summary(), "upstream page");
        }

        let normalizer = Normalizer::new(&self.symbols, self.feed.name());
        let normalized = normalizer.normalize_all(&pages)?;
        if normalized.skipped > 0 {
            tracing::debug!(skipped = normalized.skipped, "dropped incomplete upstream records");
        }
        if normalized.is_empty() {
            return Ok(0);
        }
        let inconsistent = normalized.bars.iter().filter(|b| !b.is_sane()).count();
        if inconsistent > 0 {
            tracing::debug!(inconsistent, "bars with inconsistent OHLC stored as received");
        }
        if let Some((first, last)) = normalized.time_range() {
            tracing::debug!(
                bars = normalized.bars.len(),
                first = %first.to_rfc3339(),
                last = %last.to_rfc3339(),
                "normalized batch"
            );
        }

        Ok(self.store.upsert_many(&normalized.bars)?)
    }
}
