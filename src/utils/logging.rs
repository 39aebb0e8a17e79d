//! # Logging Setup
//!
//! Wires `tracing-subscriber` for binaries and tests. The library itself
//! only emits `tracing` events and never installs a subscriber.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Initialize logging with the `RUST_LOG` environment filter, defaulting
/// to `info`. Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_default("info");
}

/// Initialize logging with an explicit default filter directive.
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

/// Initialize logging from a [`LoggingConfig`].
pub fn init_from_config(config: &LoggingConfig) {
    if !config.log_to_console {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json_format {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        // Whichever call wins the global slot, the rest are no-ops.
        init();
        init_with_default("debug");

        let mut config = LoggingConfig::default();
        init_from_config(&config);
        config.json_format = true;
        init_from_config(&config);
        config.log_to_console = false;
        init_from_config(&config);
    }
}
