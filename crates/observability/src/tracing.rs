//! Subscriber initialization.
//!
//! Filtering follows `RUST_LOG` when it is set and valid, otherwise the
//! default directive passed in.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Tests log repository internals at debug level.
pub const TEST_FILTER: &str = "info,batchrepo_repository=debug,batchrepo_store=debug";

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// JSON lines with timestamps; span fields are flattened into each event.
pub fn init_json(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Compact output through the libtest writer so it is shown only for
/// failing tests.
pub fn init_test(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .compact()
        .with_test_writer()
        .try_init();
}
