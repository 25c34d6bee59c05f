//! Logging setup.

use std::sync::Once;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter used when RUST_LOG is unset.
pub const DEFAULT_FILTER: &str = "membrane=debug";

/// Initialize logging to journald.
/// Filter controlled by RUST_LOG env var (default: membrane=debug).
/// View logs with: journalctl -t <identifier> -f
pub fn init_logging(identifier: &str) {
    static INIT_LOG: Once = Once::new();
    INIT_LOG.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        // Try journald first, fall back to stderr
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald.with_syslog_identifier(identifier.to_string()))
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
