//! Tracing bootstrap for the smoke driver.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,feed_runtime=debug,feed_smoke=debug";

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `FEED_SMOKE_LOG`, then `FEED_LOG`,
/// then the built-in default.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["FEED_SMOKE_LOG", "FEED_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
