//! Bar normalizer: upstream response shapes → ordered `Bar` records.
//!
//! - Table: every field must resolve through the alias table or the whole
//!   page fails with the missing fields and the actual columns.
//! - Keyed / flat: a record missing any field is skipped, siblings are kept.
//! - Unrecognized: logged and treated as an empty page.
//!
//! Timestamps are normalized to UTC. Naive timestamps are taken as UTC.
//! Prices become `f64`; volume is truncated to an integer.

use super::provider::DataError;
use super::response::{BarResponse, RawRecord};
use super::schema::{BarField, BarSchema, ResolvedColumns};
use crate::domain::{normalize_symbol, Bar, BarKey};
use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

/// Zoned layouts tried after RFC 3339.
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
];

/// Naive layouts, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Output of normalizing one or more pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Bars ordered by (symbol, timestamp), unique per key.
    pub bars: Vec<Bar>,
    /// Upstream rows dropped for missing or unparseable fields.
    pub skipped: usize,
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Earliest and latest timestamp across all bars.
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let min = self.bars.iter().map(|b| b.timestamp).min()?;
        let max = self.bars.iter().map(|b| b.timestamp).max()?;
        Some((min, max))
    }
}

/// Maps upstream pages to bars for one requested symbol set.
#[derive(Debug, Clone)]
pub struct Normalizer {
    requested: Vec<String>,
    source: String,
}

impl Normalizer {
    pub fn new(requested: &[String], source: impl Into<String>) -> Self {
        Self {
            requested: requested.iter().map(|s| normalize_symbol(s)).collect(),
            source: source.into(),
        }
    }

    /// Normalize every page of one fetch into a single ordered batch.
    ///
    /// When the same (timestamp, symbol) appears twice, the later page wins.
    pub fn normalize_all(&self, pages: &[BarResponse]) -> Result<Normalized, DataError> {
        let mut by_key: BTreeMap<BarKey, Bar> = BTreeMap::new();
        let mut skipped = 0;

        for page in pages {
            let normalized = self.normalize(page)?;
            skipped += normalized.skipped;
            for bar in normalized.bars {
                by_key.insert(bar.key(), bar);
            }
        }

        Ok(Normalized {
            bars: by_key.into_values().collect(),
            skipped,
        })
    }

    /// Normalize a single page.
    pub fn normalize(&self, response: &BarResponse) -> Result<Normalized, DataError> {
        let mut out = match response {
            BarResponse::Table(df) => self.from_table(df)?,
            BarResponse::Keyed(groups) => self.from_keyed(groups),
            BarResponse::Flat(records) => self.from_flat(records),
            BarResponse::Unrecognized { description } => {
                tracing::warn!(shape = %description, "unexpected bar response shape; treating as empty");
                Normalized::default()
            }
        };
        out.bars
            .sort_by(|a, b| (&a.symbol, a.timestamp).cmp(&(&b.symbol, b.timestamp)));
        Ok(out)
    }

    fn from_table(&self, df: &DataFrame) -> Result<Normalized, DataError> {
        if df.height() == 0 {
            return Ok(Normalized::default());
        }

        let cols = BarSchema::resolve(df)?;
        let table = TableColumns::load(df, &cols)?;

        let mut out = Normalized::default();
        for i in 0..df.height() {
            match table.bar_at(i, &self.source) {
                Some(bar) => out.bars.push(bar),
                None => out.skipped += 1,
            }
        }
        Ok(out)
    }

    fn from_keyed(&self, groups: &[(String, Vec<RawRecord>)]) -> Normalized {
        let mut out = Normalized::default();
        for (symbol, records) in groups {
            let symbol = normalize_symbol(symbol);
            for record in records {
                match self.record_to_bar(record, &symbol) {
                    Some(bar) => out.bars.push(bar),
                    None => out.skipped += 1,
                }
            }
        }
        out
    }

    fn from_flat(&self, records: &[RawRecord]) -> Normalized {
        let mut out = Normalized::default();
        for record in records {
            let bar = self
                .flat_symbol(record)
                .and_then(|symbol| self.record_to_bar(record, &symbol));
            match bar {
                Some(bar) => out.bars.push(bar),
                None => out.skipped += 1,
            }
        }
        out
    }

    /// The record's own symbol, or the sole requested symbol when absent.
    fn flat_symbol(&self, record: &RawRecord) -> Option<String> {
        let own = BarField::Symbol
            .lookup(record)
            .and_then(Value::as_str)
            .map(normalize_symbol)
            .filter(|s| !s.is_empty());

        match own {
            Some(symbol) => Some(symbol),
            None if self.requested.len() == 1 => self.requested.first().cloned(),
            None => None,
        }
    }

    fn record_to_bar(&self, record: &RawRecord, symbol: &str) -> Option<Bar> {
        let timestamp = BarField::Timestamp.lookup(record).and_then(value_to_ts)?;
        let open = BarField::Open.lookup(record).and_then(value_to_f64)?;
        let high = BarField::High.lookup(record).and_then(value_to_f64)?;
        let low = BarField::Low.lookup(record).and_then(value_to_f64)?;
        let close = BarField::Close.lookup(record).and_then(value_to_f64)?;
        let volume = BarField::Volume.lookup(record).and_then(value_to_f64)?;

        Some(Bar {
            timestamp,
            symbol: symbol.to_string(),
            open,
            high,
            low,
            close,
            volume: truncate_volume(volume),
            source: self.source.clone(),
        })
    }
}

/// Typed columns of a resolved bar table.
struct TableColumns {
    timestamps: Vec<Option<DateTime<Utc>>>,
    symbols: StringChunked,
    open: Float64Chunked,
    high: Float64Chunked,
    low: Float64Chunked,
    close: Float64Chunked,
    volume: Float64Chunked,
}

impl TableColumns {
    fn load(df: &DataFrame, cols: &ResolvedColumns) -> Result<Self, DataError> {
        let symbols = df
            .column(&cols.symbol)
            .and_then(|c| c.cast(&DataType::String))
            .map_err(table_err)?;

        Ok(Self {
            timestamps: timestamp_column(df.column(&cols.timestamp).map_err(table_err)?)?,
            symbols: symbols.str().map_err(table_err)?.clone(),
            open: float_column(df, &cols.open)?,
            high: float_column(df, &cols.high)?,
            low: float_column(df, &cols.low)?,
            close: float_column(df, &cols.close)?,
            volume: float_column(df, &cols.volume)?,
        })
    }

    fn bar_at(&self, i: usize, source: &str) -> Option<Bar> {
        let timestamp = self.timestamps.get(i).copied().flatten()?;
        let symbol = normalize_symbol(self.symbols.get(i)?);
        if symbol.is_empty() {
            return None;
        }

        Some(Bar {
            timestamp,
            symbol,
            open: self.open.get(i)?,
            high: self.high.get(i)?,
            low: self.low.get(i)?,
            close: self.close.get(i)?,
            volume: truncate_volume(self.volume.get(i)?),
            source: source.to_string(),
        })
    }
}

fn table_err(e: PolarsError) -> DataError {
    DataError::Table(e.to_string())
}

fn float_column(df: &DataFrame, name: &str) -> Result<Float64Chunked, DataError> {
    let col = df
        .column(name)
        .and_then(|c| c.cast(&DataType::Float64))
        .map_err(|e| DataError::Table(format!("column '{name}' is not numeric: {e}")))?;
    Ok(col.f64().map_err(table_err)?.clone())
}

/// Convert a timestamp column of any supported type to UTC instants.
fn timestamp_column(col: &Column) -> Result<Vec<Option<DateTime<Utc>>>, DataError> {
    match col.dtype() {
        DataType::String => Ok(col
            .str()
            .map_err(table_err)?
            .into_iter()
            .map(|s| s.and_then(parse_ts))
            .collect()),
        DataType::Datetime(unit, _) => {
            // Physical values are epoch offsets in UTC whether or not the
            // column carries a zone.
            let unit = *unit;
            let physical = col.cast(&DataType::Int64).map_err(table_err)?;
            Ok(physical
                .i64()
                .map_err(table_err)?
                .into_iter()
                .map(|v| v.and_then(|v| from_epoch(v, unit)))
                .collect())
        }
        dt if dt.is_integer() || dt.is_float() => {
            let secs = col.cast(&DataType::Int64).map_err(table_err)?;
            Ok(secs
                .i64()
                .map_err(table_err)?
                .into_iter()
                .map(|v| v.and_then(|s| DateTime::from_timestamp(s, 0)))
                .collect())
        }
        other => Err(DataError::Table(format!(
            "unsupported timestamp column type {other}"
        ))),
    }
}

fn from_epoch(value: i64, unit: TimeUnit) -> Option<DateTime<Utc>> {
    match unit {
        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(value),
        TimeUnit::Microseconds => DateTime::from_timestamp_micros(value),
        TimeUnit::Nanoseconds => Some(DateTime::from_timestamp_nanos(value)),
    }
}

/// Parse an upstream timestamp string to UTC.
///
/// Zoned input is converted; naive input is assumed to already be UTC.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn value_to_ts(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_ts(s),
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))?;
            DateTime::from_timestamp(secs, 0)
        }
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Volume is an integer quantity; fractional upstream values are truncated.
fn truncate_volume(volume: f64) -> u64 {
    // `as` saturates: NaN and negatives become 0.
    volume.trunc() as u64
}
