//! Upstream feed access and bar normalization

pub mod alpaca;
pub mod circuit_breaker;
pub mod normalize;
pub mod provider;
pub mod response;
pub mod schema;

pub use alpaca::{AlpacaCredentials, AlpacaFeed};
pub use circuit_breaker::CircuitBreaker;
pub use normalize::{parse_ts, Normalized, Normalizer};
pub use provider::{BarFeed, BarRequest, DataError, FeedTier, DEFAULT_ROW_LIMIT};
pub use response::{BarResponse, RawRecord, ResponseSummary};
pub use schema::{BarField, BarSchema};
