use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const TRACE_FILTER_ENV: &str = "FLEET_SYNC_TRACE";
const DEFAULT_FILTER: &str = "off";

/// Installs the stderr diagnostics subscriber.
///
/// Silent unless `FLEET_SYNC_TRACE` or `RUST_LOG` asks for output; the update
/// log file is the operator-facing record.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(trace_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn trace_filter() -> EnvFilter {
    filter_directive()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn filter_directive() -> Option<String> {
    [TRACE_FILTER_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
