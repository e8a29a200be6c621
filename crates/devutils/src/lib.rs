//! Shared setup for demos and manual testing.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global logging subscriber, filtered by `RUST_LOG` or `filter` if it isn't set.
pub fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .finish();

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("logging already initialized: {}", error);
    }
}
