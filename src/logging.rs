//! Diagnostics go to stderr; stdout carries the CNI result.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Variable holding the filter directives, e.g. `eni_cni=debug`.
pub const LOG_ENV: &str = "ENI_CNI_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
