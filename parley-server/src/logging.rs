//! Tracing setup shared by the binaries.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;

/// Initialises the global subscriber.
///
/// `RUST_LOG` overrides `level`. With `log_dir`, output goes to
/// `log_dir/file_name` through a non-blocking writer and the returned guard
/// must be held until exit; otherwise it goes to stdout.
pub fn init_logging(level: &str, log_dir: Option<&Path>, file_name: &str) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
