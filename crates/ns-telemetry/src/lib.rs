//! Logging setup for the nightshift binary and daemon.

use ns_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging from the config's logging section.
///
/// Uses the `RUST_LOG` environment variable when set, otherwise the
/// configured level. Safe to call multiple times (e.g. in tests) --
/// subsequent calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    match config.format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .try_init()
                .ok();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .try_init()
                .ok();
        }
    }

    tracing::debug!(level = config.level.as_str(), "logging initialised");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ns_core::config::LogLevel;

    #[test]
    fn init_is_idempotent() {
        let cfg = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Text,
        };
        init_logging(&cfg);
        init_logging(&cfg); // second call must not panic
    }
}
