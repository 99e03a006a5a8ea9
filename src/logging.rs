//! Logging setup.
//!
//! Log lines go to a daily-rotated file in a `logs/` directory next to the
//! database, so the corpus, the status file, and the logs travel together.
//! `SUBDEX_LOG` selects the level (`trace`..`error`); unset means `info`.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The returned guard flushes buffered log
/// lines when dropped; `main` holds it for the life of the process.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let appender = tracing_appender::rolling::daily(log_dir, "subdex.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("SUBDEX_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    tracing::debug!("logging to {}", log_dir.display());
    Ok(guard)
}
