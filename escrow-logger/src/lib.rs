//! Logger configuration for the escrowd service and its tests.
//!
//! Filtering uses the standard `RUST_LOG` directive syntax via
//! [`EnvFilter`]. With no directive set, the service logs at INFO while the
//! HTTP stack underneath the chain client is held at WARN; at one indexer
//! round-trip per job tick, connection-level DEBUG/INFO noise would
//! otherwise drown the reconciliation log.

use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Applied when `RUST_LOG` is unset or unparseable.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,reqwest=warn,h2=warn";

/// Initialize the global `tracing` subscriber: compact single-line format
/// on stdout, ANSI colors, [`DEFAULT_DIRECTIVES`] unless `RUST_LOG`
/// overrides them.
///
/// Panics if a subscriber is already installed.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Use this to initialize the global logger in tests: a no-op without
/// `RUST_LOG`, and tolerant of other test threads winning the race to
/// install the subscriber.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Try to install the global subscriber, failing if one is already set.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_log)
        .try_init()
}
