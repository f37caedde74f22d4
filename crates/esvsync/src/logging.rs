//! Process-wide log setup.
//!
//! `log` records are bridged into `tracing` so both end up in the same
//! subscriber. `RUST_LOG`, when set, wins over the configured level.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingSettings;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Builds the filter: `RUST_LOG` if set, else the configured level.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&settings.level).map_err(|e| LoggingError::InvalidFilter {
        filter: settings.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Call once at startup.
pub fn init(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_filter(settings)?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if settings.json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let subscriber = tracing_subscriber::registry().with(fmt_layer).with(filter);

    tracing_log::LogTracer::init().map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    log::debug!(
        "Logging initialized (level={}, json={})",
        settings.level,
        settings.json
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_from_settings() {
        std::env::remove_var("RUST_LOG");
        let settings = LoggingSettings {
            level: "debug".to_string(),
            json: false,
        };
        let filter = build_filter(&settings).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_rust_log_wins() {
        std::env::set_var("RUST_LOG", "esvsync=trace");
        let filter = build_filter(&LoggingSettings::default());
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.unwrap().to_string(), "esvsync=trace");
    }

    #[test]
    #[serial]
    fn test_init_twice_fails() {
        std::env::remove_var("RUST_LOG");
        let settings = LoggingSettings::default();
        // The first call may fail if a logger is already installed; the
        // second one always does.
        let _ = init(&settings);
        assert!(matches!(
            init(&settings),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
