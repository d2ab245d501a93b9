//! Log output for the controller binary.
//!
//! The subscriber starts at `info` so configuration loading is visible, and
//! the configured `logging.level` is swapped in once the config is read.
//! `RUST_LOG` always wins over both.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

const STARTUP_LEVEL: &str = "info";

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

fn filter_for(level: &str) -> EnvFilter {
    if rust_log_set() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::new(level)
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let (filter, handle) = reload::Layer::new(filter_for(STARTUP_LEVEL));
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to the configured level unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if rust_log_set() {
        return;
    }
    if let Some(handle) = FILTER_HANDLE.get() {
        if let Err(e) = handle.modify(|filter| *filter = EnvFilter::new(level)) {
            tracing::warn!(error = %e, level, "Failed to change log level");
        }
    }
}
