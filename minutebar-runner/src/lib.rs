//! minutebar runner: configuration and the ingestion poll loop.
//!
//! Builds on `minutebar-core` to provide:
//! - TOML + environment configuration, read once at startup
//! - The IDLE/CYCLE poll loop with typed per-cycle outcomes
//! - A bounded cycle log and a tracing-backed cycle reporter

pub mod config;
pub mod poller;

pub use config::{ConfigError, IngestConfig};
pub use poller::{
    CycleError, CycleLog, CycleOutcome, CycleReport, CycleReporter, FailureKind, LoopState,
    Poller, StartupError, TracingReporter,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn config_is_send_sync() {
        assert_send::<IngestConfig>();
        assert_sync::<IngestConfig>();
    }

    #[test]
    fn cycle_report_is_send_sync() {
        assert_send::<CycleReport>();
        assert_sync::<CycleReport>();
        assert_send::<CycleLog>();
        assert_sync::<CycleLog>();
    }

    #[test]
    fn poller_is_send() {
        assert_send::<Poller>();
    }
}
