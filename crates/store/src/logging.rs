//! Logging setup shared by every executable embedding the store.

use tracing_subscriber::EnvFilter;

/// Initialize tracing output to stderr, filtered by `RUST_LOG` with the
/// given default directive. Safe to call more than once; later calls are
/// no-ops.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
