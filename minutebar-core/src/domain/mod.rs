//! Domain types for minute-bar ingestion

pub mod bar;

pub use bar::{format_ts, normalize_symbol, Bar, BarKey};
