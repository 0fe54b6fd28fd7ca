//! Upstream response shapes.
//!
//! A feed page arrives as JSON in one of three layouts. The layout is resolved
//! once, here, into a closed set of variants; the normalizer then maps each
//! variant through the field alias table without probing the payload again.
//!
//! Resolution order: columnar table, keyed lists, flat list. An optional
//! `bars` or `data` envelope is unwrapped first.

use super::provider::DataError;
use super::schema::{BarField, BarSchema};
use polars::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One per-bar record from a keyed or flat payload.
pub type RawRecord = Map<String, Value>;

/// A single upstream page, resolved to its shape.
#[derive(Debug, Clone)]
pub enum BarResponse {
    /// One row per (timestamp, symbol), columns under any alias.
    Table(DataFrame),
    /// Symbol → records.
    Keyed(Vec<(String, Vec<RawRecord>)>),
    /// Records each carrying their own symbol.
    Flat(Vec<RawRecord>),
    /// No recognizable container with data.
    Unrecognized { description: String },
}

impl BarResponse {
    /// Resolve a decoded JSON page into its shape.
    ///
    /// Only building the table can fail; an unknown layout is a value, not an
    /// error.
    pub fn from_json(value: Value) -> Result<Self, DataError> {
        let payload = unwrap_envelope(value);

        match payload {
            Value::Object(obj) => {
                if is_columnar(&obj) {
                    return columnar_frame(&obj).map(BarResponse::Table);
                }
                if is_keyed(&obj) {
                    let keyed = obj
                        .into_iter()
                        .map(|(symbol, records)| (symbol, records_of(records)))
                        .collect();
                    return Ok(BarResponse::Keyed(keyed));
                }
                Ok(BarResponse::Unrecognized {
                    description: describe_shape(&Value::Object(obj)),
                })
            }
            Value::Array(items) if !items.is_empty() => {
                Ok(BarResponse::Flat(records_of(Value::Array(items))))
            }
            other => Ok(BarResponse::Unrecognized {
                description: describe_shape(&other),
            }),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            BarResponse::Table(_) => "table",
            BarResponse::Keyed(_) => "keyed",
            BarResponse::Flat(_) => "flat",
            BarResponse::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Upstream row count before normalization.
    pub fn row_count(&self) -> usize {
        match self {
            BarResponse::Table(df) => df.height(),
            BarResponse::Keyed(groups) => groups.iter().map(|(_, r)| r.len()).sum(),
            BarResponse::Flat(records) => records.len(),
            BarResponse::Unrecognized { .. } => 0,
        }
    }

    /// Diagnostic counts per symbol, as reported by the payload itself.
    pub fn summary(&self) -> ResponseSummary {
        let mut per_symbol: BTreeMap<String, usize> = BTreeMap::new();

        match self {
            BarResponse::Table(df) => {
                let columns = BarSchema::column_names(df);
                if let Some(name) = BarField::Symbol.resolve_column(&columns) {
                    if let Ok(col) = df
                        .column(name)
                        .and_then(|c| c.cast(&DataType::String))
                    {
                        if let Ok(ca) = col.str() {
                            for sym in ca.into_iter().flatten() {
                                *per_symbol.entry(sym.to_ascii_uppercase()).or_default() += 1;
                            }
                        }
                    }
                }
            }
            BarResponse::Keyed(groups) => {
                for (symbol, records) in groups {
                    *per_symbol.entry(symbol.to_ascii_uppercase()).or_default() += records.len();
                }
            }
            BarResponse::Flat(records) => {
                for record in records {
                    if let Some(Value::String(sym)) = BarField::Symbol.lookup(record) {
                        *per_symbol.entry(sym.to_ascii_uppercase()).or_default() += 1;
                    }
                }
            }
            BarResponse::Unrecognized { .. } => {}
        }

        ResponseSummary {
            shape: self.shape(),
            rows: self.row_count(),
            per_symbol,
        }
    }
}

/// Per-page diagnostics logged before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub shape: &'static str,
    pub rows: usize,
    pub per_symbol: BTreeMap<String, usize>,
}

impl fmt::Display for ResponseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} page, {} rows", self.shape, self.rows)?;
        if !self.per_symbol.is_empty() {
            let counts: Vec<String> = self
                .per_symbol
                .iter()
                .map(|(s, n)| format!("{s}={n}"))
                .collect();
            write!(f, " ({})", counts.join(", "))?;
        }
        Ok(())
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => {
            if let Some(inner) = obj.remove("bars") {
                inner
            } else if let Some(inner) = obj.remove("data") {
                inner
            } else {
                Value::Object(obj)
            }
        }
        other => other,
    }
}

/// Symbol keys mapping to record lists. A `null` entry is a symbol with no
/// bars; at least one entry must be a list.
fn is_keyed(obj: &Map<String, Value>) -> bool {
    obj.values().any(Value::is_array)
        && obj.values().all(|v| v.is_array() || v.is_null())
}

/// An object of equal-length scalar arrays, at least one of them non-empty.
fn is_columnar(obj: &Map<String, Value>) -> bool {
    let mut len = None;
    for value in obj.values() {
        let Value::Array(items) = value else {
            return false;
        };
        if items.iter().any(|v| v.is_object() || v.is_array()) {
            return false;
        }
        match len {
            None => len = Some(items.len()),
            Some(n) if n != items.len() => return false,
            Some(_) => {}
        }
    }
    matches!(len, Some(n) if n > 0)
}

fn columnar_frame(obj: &Map<String, Value>) -> Result<DataFrame, DataError> {
    let columns: Vec<Column> = obj
        .iter()
        .map(|(name, values)| {
            let items = values.as_array().map(Vec::as_slice).unwrap_or(&[]);
            json_column(name, items)
        })
        .collect();

    DataFrame::new(columns).map_err(|e| DataError::Table(format!("dataframe creation: {e}")))
}

/// Build a typed column from scalar JSON values.
///
/// Integers stay integers, any float widens the column to f64, strings stay
/// strings; mixed columns fall back to their text form.
fn json_column(name: &str, items: &[Value]) -> Column {
    let non_null = || items.iter().filter(|v| !v.is_null());

    if non_null().all(|v| v.is_i64()) {
        let values: Vec<Option<i64>> = items.iter().map(Value::as_i64).collect();
        Column::new(name.into(), values)
    } else if non_null().all(Value::is_number) {
        let values: Vec<Option<f64>> = items.iter().map(Value::as_f64).collect();
        Column::new(name.into(), values)
    } else if non_null().all(Value::is_boolean) {
        let values: Vec<Option<bool>> = items.iter().map(Value::as_bool).collect();
        Column::new(name.into(), values)
    } else {
        let values: Vec<Option<String>> = items
            .iter()
            .map(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect();
        Column::new(name.into(), values)
    }
}

fn records_of(value: Value) -> Vec<RawRecord> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => record,
                // Non-object entries carry no fields and are skipped downstream.
                _ => RawRecord::new(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn describe_shape(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(items) if items.is_empty() => "empty array".to_string(),
        Value::Array(items) => format!("array of {} items", items.len()),
        Value::Object(obj) if obj.is_empty() => "empty object".to_string(),
        Value::Object(obj) => {
            let keys: Vec<String> = obj
                .iter()
                .map(|(k, v)| format!("{k}: {}", kind_of(v)))
                .collect();
            format!("object {{{}}}", keys.join(", "))
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyed_envelope_resolves_to_keyed() {
        let page = json!({
            "bars": {
                "AAPL": [{"t": "2024-03-05T14:30:00Z", "o": 1.0, "h": 1.0, "l": 1.0, "c": 1.0, "v": 10}],
                "MSFT": []
            },
            "next_page_token": null
        });
        let resp = BarResponse::from_json(page).unwrap();
        assert_eq!(resp.shape(), "keyed");
        assert_eq!(resp.row_count(), 1);
        let summary = resp.summary();
        assert_eq!(summary.per_symbol.get("AAPL"), Some(&1));
        assert_eq!(summary.per_symbol.get("MSFT"), Some(&0));
    }

    #[test]
    fn null_symbol_entry_keeps_the_other_symbols() {
        let page = json!({
            "bars": {
                "AAPL": [{"t": "2024-03-05T14:30:00Z", "o": 1.0, "h": 1.0, "l": 1.0, "c": 1.0, "v": 10}],
                "MSFT": null
            }
        });
        let resp = BarResponse::from_json(page).unwrap();
        assert_eq!(resp.shape(), "keyed");
        assert_eq!(resp.row_count(), 1);
        assert_eq!(resp.summary().per_symbol.get("MSFT"), Some(&0));
    }

    #[test]
    fn all_null_entries_are_unrecognized() {
        let resp = BarResponse::from_json(json!({"AAPL": null, "MSFT": null})).unwrap();
        assert_eq!(resp.shape(), "unrecognized");
    }

    #[test]
    fn columnar_object_resolves_to_table() {
        let page = json!({
            "timestamp": ["2024-03-05T14:30:00Z", "2024-03-05T14:31:00Z"],
            "symbol": ["AAPL", "AAPL"],
            "open": [1.0, 2.0],
            "high": [1.5, 2.5],
            "low": [0.5, 1.5],
            "close": [1.2, 2.2],
            "volume": [100, 200]
        });
        let resp = BarResponse::from_json(page).unwrap();
        match &resp {
            BarResponse::Table(df) => {
                assert_eq!(df.height(), 2);
                assert_eq!(df.column("volume").unwrap().dtype(), &DataType::Int64);
                assert_eq!(df.column("open").unwrap().dtype(), &DataType::Float64);
            }
            other => panic!("expected table, got {}", other.shape()),
        }
        assert_eq!(resp.summary().per_symbol.get("AAPL"), Some(&2));
    }

    #[test]
    fn array_envelope_resolves_to_flat() {
        let page = json!({"data": [{"S": "AAPL", "t": "2024-03-05T14:30:00Z"}]});
        let resp = BarResponse::from_json(page).unwrap();
        assert_eq!(resp.shape(), "flat");
        assert_eq!(resp.summary().per_symbol.get("AAPL"), Some(&1));
    }

    #[test]
    fn empty_keyed_map_is_unrecognized() {
        let resp = BarResponse::from_json(json!({"bars": {}, "next_page_token": null})).unwrap();
        match resp {
            BarResponse::Unrecognized { description } => assert_eq!(description, "empty object"),
            other => panic!("expected unrecognized, got {}", other.shape()),
        }
    }

    #[test]
    fn scalar_payload_describes_its_shape() {
        let resp = BarResponse::from_json(json!({"bars": null})).unwrap();
        match resp {
            BarResponse::Unrecognized { description } => assert_eq!(description, "null"),
            other => panic!("expected unrecognized, got {}", other.shape()),
        }
    }

    #[test]
    fn object_with_mixed_values_is_unrecognized() {
        let resp = BarResponse::from_json(json!({"message": "oops", "code": 42})).unwrap();
        match resp {
            BarResponse::Unrecognized { description } => {
                assert!(description.contains("message: string"));
                assert!(description.contains("code: number"));
            }
            other => panic!("expected unrecognized, got {}", other.shape()),
        }
    }

    #[test]
    fn ragged_columns_are_not_a_table() {
        let page = json!({"AAPL": [1, 2], "MSFT": [1]});
        let resp = BarResponse::from_json(page).unwrap();
        assert_eq!(resp.shape(), "keyed");
    }

    #[test]
    fn summary_display_lists_counts() {
        let summary = ResponseSummary {
            shape: "keyed",
            rows: 3,
            per_symbol: BTreeMap::from([("AAPL".to_string(), 2), ("MSFT".to_string(), 1)]),
        };
        assert_eq!(summary.to_string(), "keyed page, 3 rows (AAPL=2, MSFT=1)");
    }
}
