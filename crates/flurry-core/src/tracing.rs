//! Logging setup for the `flurry` binary.

use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber.
///
/// Filtering comes from `RUST_LOG` and falls back to `info`. Output goes to
/// stderr; stdout carries the run summary.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
