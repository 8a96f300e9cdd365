//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber, mapping the pipeline debug
/// level to a default filter. `RUST_LOG` still wins when set. Safe to call
/// more than once; later calls are no-ops.
pub fn init(debug: i32) {
    let directive = match debug {
        i32::MIN..=0 => "warn",
        1 => "info",
        2..=3 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
