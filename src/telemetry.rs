//! Tracing subscriber setup for the binaries.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Installs a stderr fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Repeated calls are ignored, so tests and binaries can both call it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
