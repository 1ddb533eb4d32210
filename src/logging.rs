//! Structured logging setup.
//!
//! deferwork logs through `tracing` everywhere; this module installs a
//! `tracing-subscriber` formatter driven by [`LoggingConfig`]. Applications
//! that already install their own subscriber do not need to call it.

use crate::{DeferworkError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level` when set. Fails if a
/// global subscriber is already installed.
///
/// ```rust,no_run
/// use deferwork::{config::LoggingConfig, logging::init_tracing};
///
/// init_tracing(&LoggingConfig::default()).expect("no subscriber installed yet");
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| {
        DeferworkError::Config(format!("Failed to initialize tracing subscriber: {}", e))
    })
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            DeferworkError::Config(format!("Invalid log level '{}': {}", config.level, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        let config = LoggingConfig {
            level: "deferwork=debug,warn".to_string(),
            ..Default::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(build_filter(&config).is_ok());
        }
    }

    #[test]
    fn test_filter_rejects_garbage() {
        let config = LoggingConfig {
            level: "deferwork=notalevel".to_string(),
            ..Default::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(build_filter(&config), Err(DeferworkError::Config(_))));
        }
    }
}
