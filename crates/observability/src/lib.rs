//! Logging setup shared by binaries and tests of the job repository.

/// Initialize process-wide JSON logging.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init_json(tracing::DEFAULT_FILTER);
}

/// Initialize human-readable logging captured by the test harness.
pub fn init_for_tests() {
    tracing::init_test(tracing::TEST_FILTER);
}

/// Subscriber construction (filters, formats).
pub mod tracing;
