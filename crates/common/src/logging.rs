//! Logging and tracing setup.
//!
//! Provides structured logging configuration using `tracing`, with a compact
//! layer for local development and a JSON layer for deployed environments
//! where logs are shipped to an aggregator.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with a compact, human-readable format.
///
/// Reads the level from `RUST_LOG`, defaulting to `info`. Examples:
///   RUST_LOG=debug cargo run            -> debug and higher
///   RUST_LOG=bridge=trace cargo run      -> trace for this crate only
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .compact(),
        )
        .init();
}

/// Initialize tracing with JSON output, for log-aggregator ingestion.
pub fn init_tracing_json() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_level(true)
                .with_current_span(true),
        )
        .init();
}

/// Initialize tracing, selecting JSON vs compact based on `LOG_FORMAT`.
///
/// `LOG_FORMAT=json` selects [`init_tracing_json`]; anything else (including
/// unset) selects [`init_tracing`].
pub fn init_tracing_from_env() {
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => init_tracing_json(),
        _ => init_tracing(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{error, info, warn};

    #[test]
    fn test_tracing_init() {
        // Initializing twice in a test binary panics; tolerate that here.
        let _result = std::panic::catch_unwind(init_tracing);

        info!("test log message");
        warn!(count = 42, "warning with structured data");
        error!(error = "test error", "error message");
    }
}
