//! Upstream bar feed trait, request type and structured error types.
//!
//! The BarFeed trait abstracts over the upstream market-data client so the poll
//! loop can be driven by a real brokerage feed or by a scripted feed in tests.

use super::response::BarResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default row cap per request, high enough to cover a full session of
/// minute bars for a handful of symbols without silent truncation.
pub const DEFAULT_ROW_LIMIT: usize = 10_000;

/// Structured error types for feed and normalization failures.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("http client error: {0}")]
    Client(String),

    #[error("hard stop: feed is cooling down after rate limiting (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("bar table missing required field(s) {missing:?}; columns: {columns:?}")]
    MissingFields {
        missing: Vec<&'static str>,
        columns: Vec<String>,
    },

    #[error("bar table error: {0}")]
    Table(String),
}

/// Named upstream data tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTier {
    /// Free single-venue feed; sparse outside regular hours.
    #[default]
    Iex,
    Sip,
    DelayedSip,
    Otc,
}

impl FeedTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTier::Iex => "iex",
            FeedTier::Sip => "sip",
            FeedTier::DelayedSip => "delayed_sip",
            FeedTier::Otc => "otc",
        }
    }
}

impl std::str::FromStr for FeedTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iex" => Ok(FeedTier::Iex),
            "sip" => Ok(FeedTier::Sip),
            "delayed_sip" => Ok(FeedTier::DelayedSip),
            "otc" => Ok(FeedTier::Otc),
            other => Err(format!("unknown feed tier '{other}'")),
        }
    }
}

/// One-minute bar request for a symbol set over `[start, end]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BarRequest {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub feed: FeedTier,
    pub limit: usize,
}

/// Trait for upstream bar feeds.
///
/// A fetch returns one `BarResponse` per upstream page, each already resolved
/// to one of the known shapes. The store sits above this trait; feeds don't
/// know about it.
pub trait BarFeed: Send {
    /// Provenance tag written into every bar this feed produces.
    fn name(&self) -> &str;

    /// Fetch one-minute bars for the request's symbols and window.
    fn fetch_bars(&self, request: &BarRequest) -> Result<Vec<BarResponse>, DataError>;

    /// Whether the feed is currently accepting requests.
    fn is_available(&self) -> bool {
        true
    }
}
