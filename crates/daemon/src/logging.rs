//! Logging setup.
//!
//! Everything goes to stdout through an `EnvFilter`. When a log directory is
//! configured, records for the `audit`, `auth` and `conn` targets are also
//! written to their own files through non-blocking writers.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Target for filesystem mutations and security events.
pub const AUDIT_TARGET: &str = "audit";

/// Target for login and registration attempts.
pub const AUTH_TARGET: &str = "auth";

/// Target for connection lifecycle records.
pub const CONN_TARGET: &str = "conn";

/// File name for each dedicated target, relative to the log directory.
pub const TARGET_FILES: &[(&str, &str)] = &[
    (AUDIT_TARGET, "file_operations.log"),
    (AUTH_TARGET, "auth.log"),
    (CONN_TARGET, "connections.log"),
];

/// Build the console filter.
///
/// `RUST_LOG` wins when set; otherwise the configured level is used, raised
/// to `debug` by `--verbose`.
pub fn console_filter(level: &str, verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()))
}

/// Install the global subscriber.
///
/// The returned guards flush the file writers when dropped and must be held
/// for the lifetime of the process.
pub fn init_logging(
    level: &str,
    verbose: bool,
    log_dir: Option<&Path>,
) -> Result<Vec<WorkerGuard>> {
    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_filter(console_filter(level, verbose));

    let mut guards = Vec::new();
    let mut file_layers = Vec::new();

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        for (target, file_name) in TARGET_FILES {
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target(*target, Level::TRACE))
                .boxed();
            file_layers.push(layer);
        }
    }

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!("Logger initialized");
    Ok(guards)
}
