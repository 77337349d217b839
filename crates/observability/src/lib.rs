//! Tracing setup shared by queue hosts, workers and tests.

/// Subscriber configuration (filters, output format).
pub mod subscriber;

pub use subscriber::{LogFormat, SubscriberConfig};

/// Initialize process-wide tracing with JSON output, filtered by `RUST_LOG`
/// (default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&SubscriberConfig::default());
}
