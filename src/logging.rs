//! Structured logging setup. `RUST_LOG` (default `info`) controls
//! verbosity; spans carry `collection`/`shard_id`/`stage` fields so
//! concurrent worker output stays attributable to the task that produced it.

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global tracing subscriber. Call once from `main`.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_target(false).init();
    });
}

/// Idempotent variant safe to call from multiple test threads.
#[cfg(any(test, feature = "test-support"))]
pub fn init_for_tests() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
