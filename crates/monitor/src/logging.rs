//! Tracing setup: human-readable output on stdout plus the persistent
//! operational log in the log directory.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const OPERATIONAL_LOG_PREFIX: &str = "power_monitor";
const OPERATIONAL_LOG_SUFFIX: &str = "log";
/// Rotated files kept on disk, today's included.
const OPERATIONAL_LOG_KEEP: usize = 5;

/// Daily-rotated `power_monitor.<date>.log` in `dir`.
pub fn operational_log(dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(OPERATIONAL_LOG_PREFIX)
        .filename_suffix(OPERATIONAL_LOG_SUFFIX)
        .max_log_files(OPERATIONAL_LOG_KEEP)
        .build(dir)
        .with_context(|| format!("failed to open operational log in {}", dir.display()))
}

/// Install the global subscriber.  `RUST_LOG` wins; otherwise everything at
/// `info`.  The returned guard flushes the file writer on drop and must be
/// held for the life of the process.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    let (file_writer, guard) = tracing_appender::non_blocking(operational_log(log_dir)?);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

// ===========================================================================
// Tests
// ===========================================================================
