//! Tracing setup for the agent binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "group_agent=info,agent=info";

/// Install a stderr subscriber filtered by `RUST_LOG`.
///
/// ```bash
/// RUST_LOG=group_agent=debug agent --once
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
