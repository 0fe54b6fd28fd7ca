//! Field alias table for upstream bar payloads.
//!
//! Upstream column and attribute names vary (`open` vs `o`, `timestamp` vs
//! `t`). Every required bar field is resolved through an explicit alias list,
//! checked in order, for both tabular columns and per-record keys.

use super::provider::DataError;
use super::response::RawRecord;
use polars::prelude::*;
use serde_json::Value;

/// A field a bar needs from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarField {
    Timestamp,
    Symbol,
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    /// Every field a tabular payload must carry, in reporting order.
    pub const ALL: [BarField; 7] = [
        BarField::Timestamp,
        BarField::Symbol,
        BarField::Open,
        BarField::High,
        BarField::Low,
        BarField::Close,
        BarField::Volume,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BarField::Timestamp => "timestamp",
            BarField::Symbol => "symbol",
            BarField::Open => "open",
            BarField::High => "high",
            BarField::Low => "low",
            BarField::Close => "close",
            BarField::Volume => "volume",
        }
    }

    /// Accepted upstream names, most preferred first.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            BarField::Timestamp => &["timestamp", "time", "t"],
            BarField::Symbol => &["symbol", "S"],
            BarField::Open => &["open", "o"],
            BarField::High => &["high", "h"],
            BarField::Low => &["low", "l"],
            BarField::Close => &["close", "c"],
            BarField::Volume => &["volume", "v"],
        }
    }

    /// First alias present in `columns`.
    pub fn resolve_column<'a>(self, columns: &'a [String]) -> Option<&'a str> {
        self.aliases()
            .iter()
            .find_map(|alias| columns.iter().find(|c| c.as_str() == *alias))
            .map(String::as_str)
    }

    /// First alias present in `record` with a non-null value.
    pub fn lookup(self, record: &RawRecord) -> Option<&Value> {
        self.aliases()
            .iter()
            .filter_map(|alias| record.get(*alias))
            .find(|v| !v.is_null())
    }
}

/// Column names a table resolved to, one per required field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub timestamp: String,
    pub symbol: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

/// Alias resolution for tabular bar payloads.
pub struct BarSchema;

impl BarSchema {
    pub fn column_names(df: &DataFrame) -> Vec<String> {
        df.get_column_names()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    /// Resolve every required field to an actual column.
    ///
    /// Fails with all missing fields and the full column list, never just the
    /// first miss.
    pub fn resolve(df: &DataFrame) -> Result<ResolvedColumns, DataError> {
        let columns = Self::column_names(df);
        let mut missing = Vec::new();
        let mut found = Vec::with_capacity(BarField::ALL.len());

        for field in BarField::ALL {
            match field.resolve_column(&columns) {
                Some(col) => found.push(col.to_string()),
                None => missing.push(field.name()),
            }
        }

        if !missing.is_empty() {
            return Err(DataError::MissingFields { missing, columns });
        }

        let mut found = found.into_iter();
        let mut next = || found.next().unwrap_or_default();
        Ok(ResolvedColumns {
            timestamp: next(),
            symbol: next(),
            open: next(),
            high: next(),
            low: next(),
            close: next(),
            volume: next(),
        })
    }
}
