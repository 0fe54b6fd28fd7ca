//! minutebar core: minute-bar ingestion building blocks.
//!
//! - Domain types (bars, symbols)
//! - Session window calculator for US regular trading hours
//! - Upstream feed trait, Alpaca client, response variants and normalizer
//! - SQLite bar store with idempotent upsert
//! - Read-side snapshot query

pub mod data;
pub mod domain;
pub mod session;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types shared with the poll loop thread are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::Bar>();
        require_sync::<domain::Bar>();
        require_send::<session::SessionWindow>();
        require_sync::<session::SessionWindow>();
        require_send::<session::MarketCalendar>();
        require_sync::<session::MarketCalendar>();
        require_send::<data::BarRequest>();
        require_sync::<data::BarRequest>();
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
        require_send::<data::AlpacaFeed>();
        require_send::<snapshot::Snapshot>();
        require_sync::<snapshot::Snapshot>();

        // The store handle moves into the poller thread but is not shared.
        require_send::<store::BarStore>();
    }

    /// The feed trait stays object-safe so the poller can hold `Box<dyn BarFeed>`.
    #[test]
    fn bar_feed_is_object_safe() {
        fn _takes_boxed(feed: Box<dyn data::BarFeed>) -> String {
            feed.name().to_string()
        }
    }
}
