//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration; we log to stderr so
/// that stdout stays usable for command output.
pub fn initialize_tracing() {
    let format = tracing_subscriber::fmt::layer()
        .without_time()
        .with_writer(std::io::stderr)
        .compact();
    tracing_subscriber::registry()
        .with(format)
        .with(EnvFilter::from_default_env())
        .init();
}
