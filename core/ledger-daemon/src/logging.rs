//! Subscriber setup: stderr always, plus a daily-rotated file when the
//! configuration names a log directory.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "logon-ledger";
const LOG_FILE_SUFFIX: &str = "log";

/// Installs the global subscriber.
///
/// Hold the returned guard until exit so buffered file output is flushed.
pub fn init(log_dir: Option<&Path>, max_files: usize) -> Option<WorkerGuard> {
    let (file_writer, guard, file_error) = match log_dir.map(|dir| file_appender(dir, max_files)) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard), None)
        }
        Some(Err(err)) => (None, None, Some(err)),
        None => (None, None, None),
    };

    let file_layer = file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(err) = file_error {
        tracing::warn!(error = %err, "Failed to open log directory; logging to stderr only");
    }

    guard
}

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var("LOGON_LEDGER_DEBUG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn file_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender, String> {
    fs_err::create_dir_all(dir).map_err(|err| format!("Failed to create log dir: {}", err))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|err| format!("Failed to open rolling log file: {}", err))
}
