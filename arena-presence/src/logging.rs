//! Subscriber setup for processes embedding the presence layer

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Install a global subscriber for presence logs
///
/// The configured level applies to this crate only; everything else stays at
/// `warn` so Redis client chatter does not drown presence events. `RUST_LOG`
/// replaces the whole filter when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(&config.level)?)?,
    };

    let writer = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_line_number(true);
    let layer = if config.format == "json" {
        layer.json().with_current_span(true).boxed()
    } else {
        layer.pretty().with_file(false).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Filter directives for a configured level, e.g. `warn,arena_presence=debug`
fn default_directives(level: &str) -> anyhow::Result<String> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => anyhow::bail!("Invalid log level: {level}"),
    };
    Ok(format!(
        "warn,{}={}",
        env!("CARGO_CRATE_NAME"),
        level.as_str().to_lowercase()
    ))
}
