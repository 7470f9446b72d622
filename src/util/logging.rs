//! Tracing subscriber setup for hosts that do not install their own.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "avv=info";

/// Install a global fmt subscriber filtered by `RUST_LOG` (or `default_filter`).
///
/// Returns `false` if a global subscriber was already set, which is not an
/// error: embedding applications usually configure tracing themselves.
pub fn init_logging(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
