//! Logging setup shared by the library's embedders and the CLI.

use std::path::Path;

use drivecap_shared::constants::envs::DRIVECAP_LOG;
use drivecap_shared::{DrivecapError, DrivecapResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Log file written under the log directory, rotated daily.
pub const LOG_FILE_PREFIX: &str = "drivecap.log";

/// Build the filter from `DRIVECAP_LOG`, falling back to `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(DRIVECAP_LOG)
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// With `log_dir` set, logs go to a daily-rotated file there and the
/// returned guard must be kept alive to flush the background writer.
/// Otherwise logs go to stderr. A subscriber installed earlier wins; this
/// is then a no-op.
pub fn init_logging(log_dir: Option<&Path>, default_filter: &str) -> DrivecapResult<Option<WorkerGuard>> {
    let filter = env_filter(default_filter);
    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                DrivecapError::Storage(format!(
                    "failed to create log dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            register_to_tracing(non_blocking, filter);
            Ok(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .try_init();
            Ok(None)
        }
    }
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}
