//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging with optional file
//! output, on top of the tracing ecosystem.

use crate::config::LoggingConfig;
use crate::error::Result;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds the level filter: `RUST_LOG` wins over the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?)
}

/// Initialize logging based on configuration.
///
/// Sets up structured logging in JSON or human-readable form on stderr, and
/// additionally appends to `file_path` when configured.
///
/// # Errors
///
/// Returns an error if the level filter is invalid, the log file cannot be
/// opened, or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use cryostat::config::LoggingConfig;
/// use cryostat::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);

    if config.json_format {
        let stderr_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new().create(true).append(true).open(file_path)?;
            let file_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(Arc::new(file));
            registry.with(stderr_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stderr_layer).try_init()?;
        }
    } else {
        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_writer(std::io::stderr);

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new().create(true).append(true).open(file_path)?;
            let file_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            registry.with(stderr_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}
