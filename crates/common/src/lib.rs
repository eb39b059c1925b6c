mod backoff;
mod environment;

pub use backoff::{ExponentialBackoff, RetryBudget};
pub use environment::{MarketDataEndpoint, ParseEndpointError, PRODUCTION_WS_URL};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
