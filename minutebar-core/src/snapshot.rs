//! Read-side snapshot: the last N bars per symbol as JSON-ready records.
//!
//! Pure reads. Safe to run from another process while the poller writes.
//! All symbols are read inside one transaction, so the whole snapshot
//! reflects a single committed batch.

use crate::domain::{normalize_symbol, Bar};
use crate::store::{BarStore, StoreError, StoreOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One bar as handed to consumers: `{t, o, h, l, c, v}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBar {
    pub t: String,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl From<&Bar> for SnapshotBar {
    fn from(bar: &Bar) -> Self {
        Self {
            t: bar.ts_key(),
            o: bar.open,
            h: bar.high,
            l: bar.low,
            c: bar.close,
            v: bar.volume as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub db_path: String,
}

/// Last `window` bars per requested symbol, oldest first.
///
/// Every requested symbol has a key; symbols without data map to `[]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub window: usize,
    pub series: BTreeMap<String, Vec<SnapshotBar>>,
    pub meta: SnapshotMeta,
}

impl Snapshot {
    fn empty(symbols: &[String], window: usize, db_path: &Path) -> Self {
        Self {
            window,
            series: symbols
                .iter()
                .map(|s| (normalize_symbol(s), Vec::new()))
                .collect(),
            meta: SnapshotMeta {
                db_path: db_path.display().to_string(),
            },
        }
    }

    pub fn to_json_string(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

/// Snapshot from an open store handle.
pub fn snapshot(
    store: &BarStore,
    symbols: &[String],
    window: usize,
) -> Result<Snapshot, StoreError> {
    let mut snap = Snapshot::empty(symbols, window, store.path());
    store.read_consistent(|store| {
        if !store.has_schema()? {
            return Ok(());
        }
        for (symbol, series) in snap.series.iter_mut() {
            let bars = store.read_last_n(symbol, window)?;
            *series = bars.iter().map(SnapshotBar::from).collect();
        }
        Ok(())
    })?;
    Ok(snap)
}

/// Snapshot straight from a store file, opened read-only.
///
/// A file that does not exist yet (poller never ran) yields empty lists.
pub fn snapshot_at(
    db_path: impl AsRef<Path>,
    symbols: &[String],
    window: usize,
) -> Result<Snapshot, StoreError> {
    let db_path = db_path.as_ref();
    if !db_path.exists() {
        tracing::debug!(path = %db_path.display(), "store file absent; empty snapshot");
        return Ok(Snapshot::empty(symbols, window, db_path));
    }

    let store = BarStore::open_read_only(db_path, StoreOptions::default())?;
    snapshot(&store, symbols, window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(symbol: &str, n: i64) -> Vec<Bar> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap();
        (0..n)
            .map(|i| Bar {
                timestamp: t0 + Duration::minutes(i),
                symbol: symbol.into(),
                open: 10.0 + i as f64,
                high: 11.0 + i as f64,
                low: 9.0 + i as f64,
                close: 10.5 + i as f64,
                volume: 100 * (i as u64 + 1),
                source: "alpaca".into(),
            })
            .collect()
    }

    #[test]
    fn missing_file_gives_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.sqlite");
        let snap = snapshot_at(&path, &["aapl".into(), "MSFT".into()], 5).unwrap();

        assert_eq!(snap.window, 5);
        assert!(snap.series["AAPL"].is_empty());
        assert!(snap.series["MSFT"].is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn missing_table_gives_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.sqlite");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE other (x INTEGER)")
            .unwrap();

        let snap = snapshot_at(&path, &["AAPL".into()], 5).unwrap();
        assert!(snap.series["AAPL"].is_empty());
    }

    #[test]
    fn returns_last_window_bars_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.sqlite");
        let mut store = BarStore::open(&path).unwrap();
        store.upsert_many(&bars("AAPL", 8)).unwrap();

        let snap = snapshot(&store, &["aapl".into(), "TSLA".into()], 3).unwrap();
        let aapl = &snap.series["AAPL"];
        assert_eq!(aapl.len(), 3);
        assert_eq!(aapl[0].t, "2024-03-05T14:35:00+00:00");
        assert_eq!(aapl[2].t, "2024-03-05T14:37:00+00:00");
        assert_eq!(aapl[2].v, 800.0);
        assert!(snap.series["TSLA"].is_empty());
    }

    #[test]
    fn json_has_documented_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.sqlite");
        let mut store = BarStore::open(&path).unwrap();
        store.upsert_many(&bars("MSFT", 1)).unwrap();

        let rendered = snapshot(&store, &["MSFT".into()], 60)
            .unwrap()
            .to_json_string(false)
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(json["window"], 60);
        assert_eq!(json["meta"]["db_path"], path.display().to_string());
        let bar = &json["series"]["MSFT"][0];
        assert_eq!(bar["t"], "2024-03-05T14:30:00+00:00");
        assert_eq!(bar["o"], 10.0);
        assert_eq!(bar["v"], 100.0);
    }
}
