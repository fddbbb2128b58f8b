//! File logging for the CLI.
//!
//! stdout belongs to command output, so diagnostics go to a daily rolling
//! file under `~/.stint/logs`. `STINT_LOG` takes an `EnvFilter` directive;
//! the default only records warnings.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "STINT_LOG";
const LOG_FILE_PREFIX: &str = "stint-cli.log";

/// Keep the returned guard alive for the life of the process so buffered
/// lines are flushed on exit. Returns `None` if the log directory is unusable.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".stint").join("logs");
    fs_err::create_dir_all(&log_dir).ok()?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
