//! Log sink initialisation.
//!
//! The host logs through `tracing`. `RUST_LOG` wins over the configured level so a
//! single module can be turned up without touching the config file.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Target used by per-extension loggers.
pub const EXTENSION_TARGET: &str = "plugin_host::extension";

/// Install the global subscriber. Calling it again is a no-op.
pub fn init(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("plugin_host={}", config.level)));

    let result = if config.json {
        // JSON format for production/container environments
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
