//! SQLite bar store keyed by `(ts_utc, symbol)`.
//!
//! Layout: one `market_bars` table, primary key `(ts_utc, symbol)`, with
//! `ts_utc` as RFC 3339 UTC text so text order is time order.
//!
//! - Idempotent schema creation on every open
//! - Last-writer-wins upsert, one IMMEDIATE transaction per batch
//! - WAL journal so readers see the pre- or post-batch state, never a mix
//! - `read_consistent` pins one WAL snapshot across several reads
//! - Bounded busy wait on lock contention, then `StoreError::Busy`

use crate::data::parse_ts;
use crate::domain::{normalize_symbol, Bar};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default bounded wait for a locked database file.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS market_bars (
        ts_utc TEXT NOT NULL,
        symbol TEXT NOT NULL,
        o REAL, h REAL, l REAL, c REAL, v REAL,
        src TEXT DEFAULT 'alpaca',
        PRIMARY KEY (ts_utc, symbol)
    )";

const UPSERT_SQL: &str = "
    INSERT INTO market_bars (ts_utc, symbol, o, h, l, c, v, src)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(ts_utc, symbol) DO UPDATE SET
        o = excluded.o,
        h = excluded.h,
        l = excluded.l,
        c = excluded.c,
        v = excluded.v,
        src = excluded.src";

const LAST_N_SQL: &str = "
    SELECT ts_utc, symbol, o, h, l, c, v, src
    FROM market_bars
    WHERE symbol = ?1
    ORDER BY ts_utc DESC
    LIMIT ?2";

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store busy: database stayed locked past the wait timeout ({0})")]
    Busy(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("corrupt row for {symbol}: unparseable ts_utc '{ts}'")]
    CorruptRow { symbol: String, ts: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Busy(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// Knobs for opening a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a statement waits on a locked file before failing.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Row count and time range for one stored symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub rows: u64,
    pub first: String,
    pub last: String,
}

/// Durable bar table over one SQLite file.
pub struct BarStore {
    path: PathBuf,
    conn: Connection,
}

impl BarStore {
    /// Open (creating if needed) a writable store with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open a writable store: parent directory, WAL journal, schema.
    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(options.lock_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %path.display(), mode = %mode, "store not in WAL mode");
        }

        let store = Self { path, conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open an existing store for reads only. Never creates the file.
    pub fn open_read_only(
        path: impl AsRef<Path>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(options.lock_timeout)?;
        Ok(Self { path, conn })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the bar table if absent. Safe to call repeatedly.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(())
    }

    /// Whether the bar table exists (a fresh or foreign file may lack it).
    pub fn has_schema(&self) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'market_bars'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Run several reads against a single committed state.
    ///
    /// Everything `f` reads sits inside one deferred transaction, so a batch
    /// committed by the writer midway is either fully visible or not at all.
    pub fn read_consistent<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// Insert or replace a batch of bars atomically.
    ///
    /// Existing keys get their o/h/l/c/v/src replaced. Returns the number of
    /// bars written. Either the whole batch lands or none of it does.
    pub fn upsert_many(&mut self, bars: &[Bar]) -> Result<usize, StoreError> {
        if bars.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for bar in bars {
                stmt.execute(params![
                    bar.ts_key(),
                    normalize_symbol(&bar.symbol),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume as f64,
                    bar.source,
                ])?;
            }
        }
        tx.commit()?;

        Ok(bars.len())
    }

    /// The `n` most recent bars for `symbol`, oldest first.
    ///
    /// Unknown symbols yield an empty vec.
    pub fn read_last_n(&self, symbol: &str, n: usize) -> Result<Vec<Bar>, StoreError> {
        let symbol = normalize_symbol(symbol);
        let limit = i64::try_from(n).unwrap_or(i64::MAX);

        let mut stmt = self.conn.prepare_cached(LAST_N_SQL)?;
        let rows = stmt
            .query_map(params![symbol, limit], |row| {
                Ok(StoredRow {
                    ts: row.get(0)?,
                    symbol: row.get(1)?,
                    o: row.get(2)?,
                    h: row.get(3)?,
                    l: row.get(4)?,
                    c: row.get(5)?,
                    v: row.get(6)?,
                    src: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Fetched newest-first for the LIMIT; flip to chronological.
        let mut bars = rows
            .into_iter()
            .map(StoredRow::into_bar)
            .collect::<Result<Vec<_>, _>>()?;
        bars.reverse();
        Ok(bars)
    }

    /// Number of stored bars for `symbol`.
    pub fn count(&self, symbol: &str) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM market_bars WHERE symbol = ?1",
            params![normalize_symbol(symbol)],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Per-symbol row counts and time ranges, by symbol.
    pub fn symbols(&self) -> Result<Vec<SymbolStats>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, COUNT(*), MIN(ts_utc), MAX(ts_utc)
             FROM market_bars
             GROUP BY symbol
             ORDER BY symbol",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(SymbolStats {
                    symbol: row.get(0)?,
                    rows: row.get::<_, i64>(1)?.max(0) as u64,
                    first: row.get(2)?,
                    last: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

/// One `market_bars` row as stored. Price columns are nullable in the schema.
struct StoredRow {
    ts: String,
    symbol: String,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: Option<f64>,
    v: Option<f64>,
    src: Option<String>,
}

impl StoredRow {
    fn into_bar(self) -> Result<Bar, StoreError> {
        let timestamp = parse_ts(&self.ts).ok_or_else(|| StoreError::CorruptRow {
            symbol: self.symbol.clone(),
            ts: self.ts.clone(),
        })?;

        Ok(Bar {
            timestamp,
            symbol: self.symbol,
            open: self.o.unwrap_or(f64::NAN),
            high: self.h.unwrap_or(f64::NAN),
            low: self.l.unwrap_or(f64::NAN),
            close: self.c.unwrap_or(f64::NAN),
            volume: self.v.map(|v| v.trunc() as u64).unwrap_or(0),
            source: self.src.unwrap_or_default(),
        })
    }
}
