//! Shared logging setup for Prow binaries.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "prow_crier=info,prow_api=info,prow_artifacts=info,prow_triggers=info";

/// Logging configuration shared by Prow binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// When set, also write a daily-rotated log file under this
    /// directory.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the background file writer alive. Hold it for the lifetime of
/// the process.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing with stderr output and an optional rolling file.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }
    });

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.log_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender =
                tracing_appender::rolling::daily(&dir, format!("{}.log", config.app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .and_then(stderr_layer)
                        .with_filter(filter),
                )
                .init();
            Ok(LogGuard {
                _file_guard: Some(guard),
            })
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer.with_filter(filter))
                .init();
            Ok(LogGuard { _file_guard: None })
        }
    }
}
