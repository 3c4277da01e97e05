// packages/pool/src/observability/mod.rs
//! Logging and metrics
//!
//! Log output goes through `tracing`; counters and gauges go through the
//! `metrics` facade. No metrics recorder is installed here: an embedding
//! service installs its own exporter, otherwise the calls are no-ops.

pub mod metrics;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level`. Output goes to stderr, as JSON
/// lines when `json` is set. Only the first call has any effect.
pub fn init_tracing(level: &str, json: bool) {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(filter);

        let _ = if json {
            builder.json().try_init()
        } else {
            builder.with_ansi(false).try_init()
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing("debug", false);
        init_tracing("trace", true);
        tracing::info!("still logging after a second init");
    }
}
