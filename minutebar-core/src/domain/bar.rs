//! Bar: one minute of trading activity for one symbol.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a stored bar: `(timestamp, symbol)`.
pub type BarKey = (DateTime<Utc>, String);

/// OHLCV bar for a single symbol over a single minute.
///
/// `timestamp` is always UTC. `source` tags the feed integration the bar came
/// from and is replaced along with the prices when a bar is re-ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub source: String,
}

impl Bar {
    pub fn key(&self) -> BarKey {
        (self.timestamp, self.symbol.clone())
    }

    /// Canonical text form of the timestamp as stored in `ts_utc`.
    ///
    /// Second precision with an explicit `+00:00` offset, so text order is
    /// chronological order.
    pub fn ts_key(&self) -> String {
        format_ts(self.timestamp)
    }

    /// OHLC ordering check: high >= open/close/low, low <= open/close.
    ///
    /// Informational only; upstream data is trusted and never rejected on it.
    pub fn is_sane(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// Render an instant the way the store keys it.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Trim and uppercase a ticker.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}
