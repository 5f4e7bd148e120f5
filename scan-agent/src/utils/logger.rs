//! Logging configuration using tracing.

use crate::config::LogConfig;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging from the log configuration.
///
/// Stdout is always a sink; when `write_log` is set, records are also
/// appended (without ANSI colors) to `log.path`.
pub fn init(level: &str, log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = if log.write_log {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(())
}
