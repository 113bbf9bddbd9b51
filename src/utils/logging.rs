//! Logging initialization for Conduit.
//!
//! Supports three formats:
//! - `pretty`: human-readable multi-line output
//! - `component`: `[timestamp] [LEVEL] target message {fields}`, compact and
//!   grep-friendly; use the [`log_component!`] macro to add a `component`
//!   field for per-subsystem filtering
//! - `json`: structured JSON lines for log aggregators

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Initialize the global tracing subscriber from config.
///
/// Call this once at startup before any tracing events are emitted.
/// Falls back to `RUST_LOG` env var; if unset, uses `cfg.level`.
/// Fails when the log file cannot be opened or a subscriber is already set.
pub fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let file = match &cfg.file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path))?,
        ),
        None => None,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (cfg.format, file) {
        (LogFormat::Json, Some(file)) => builder
            .json()
            .with_writer(std::sync::Mutex::new(file))
            .try_init(),
        (LogFormat::Json, None) => builder.json().try_init(),
        (LogFormat::Pretty, Some(file)) => builder
            .pretty()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .try_init(),
        (LogFormat::Pretty, None) => builder.pretty().try_init(),
        (LogFormat::Component, Some(file)) => builder
            .compact()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .try_init(),
        (LogFormat::Component, None) => builder.compact().with_target(true).try_init(),
    };

    result
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to install tracing subscriber")
}

/// Emit a component-tagged tracing event.
///
/// Works with any tracing level (`trace`, `debug`, `info`, `warn`, `error`).
/// The `component` field makes it easy to grep logs by subsystem:
///
/// ```
/// # use conduit::log_component;
/// log_component!(info, "approval", "request created");
/// log_component!(warn, "context", "token budget low", used = 8000u64, limit = 10000u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}
