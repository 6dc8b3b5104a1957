//! ==============================================================================
//! logging.rs - tracing subscriber setup
//! ==============================================================================

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global console subscriber.
///
/// `RUST_LOG` wins over `default_level` when set.
pub fn init_logging(default_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter_for(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}

/// filter for the configured level, falling back to `info` on a typo
fn env_filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_fallback() {
        for level in ["info", "debug", "warn", "nm_monitor=trace,warn", "not a level!!"] {
            // must not panic for any input
            drop(env_filter_for(level));
        }
    }
}
