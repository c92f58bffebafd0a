//! Logging setup with dual output (stdout + proxy.log)

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log file written in the working directory
pub const LOG_FILE: &str = "proxy.log";

fn filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize logging to stdout and `proxy.log`
///
/// Both outputs take their level from `RUST_LOG`, `info` when unset. The
/// returned guard flushes the file writer when dropped; keep it alive for the
/// life of the process.
#[must_use = "dropping the guard stops file logging"]
pub fn init_dual_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .init();

    guard
}
