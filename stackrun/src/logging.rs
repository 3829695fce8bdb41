//! Diagnostic tracing for debugging stackrun itself.
//!
//! Tracing is developer output controlled by `RUST_LOG` and written to stderr.
//! The per-stack progress lines and the run summary are product output and
//! go through the console event sink instead.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=stackrun=debug stackrun run -- terraform plan
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
