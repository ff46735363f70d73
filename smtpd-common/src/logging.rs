//! Ambient logging setup: an `incoming`/`outgoing`/`internal` three-way
//! split of spans, and an `init()` that reads `LOG_LEVEL` with a
//! debug/release-dependent default.

use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::FilterFn, prelude::*};

/// Initializes a global `tracing` subscriber. Library code never calls
/// this itself -- only the embedding application (or `smtpd-server`'s demo
/// binary) should, exactly once, at startup.
pub fn init() {
    let level = match std::env::var("LOG_LEVEL") {
        Ok(level) => match level.to_ascii_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        },
        Err(_) if cfg!(debug_assertions) => LevelFilter::DEBUG,
        Err(_) => LevelFilter::INFO,
    };

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_filter(level)
                .with_filter(FilterFn::new(|_metadata| true)),
        )
        .try_init();
}

/// Logs a line the server wrote to a client.
#[tracing::instrument(level = "trace", skip(line))]
pub fn outgoing(session: &str, line: &str) {
    tracing::trace!(session, line, "outgoing");
}

/// Logs a line received from a client.
#[tracing::instrument(level = "trace", skip(line))]
pub fn incoming(session: &str, line: &str) {
    tracing::trace!(session, line, "incoming");
}

/// Logs an internal, non-wire event (accept, shutdown, error).
#[tracing::instrument(level = "debug", skip(message))]
pub fn internal(session: &str, message: &str) {
    tracing::debug!(session, message, "internal");
}
