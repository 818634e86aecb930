//! Tracing setup: console output plus a rolling log file.
//!
//! Log lines go to stdout and to daily-rolling files named after
//! `logging.file` in `logging.dir`. File writing is non-blocking; the
//! returned [`WorkerGuard`] must be held for the lifetime of the process
//! or buffered lines are lost on exit.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::settings::LoggingSettings;

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from the configured
/// level. Returns the appender guard; drop it only at process exit.
pub fn init(settings: &LoggingSettings) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.dir)?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &settings.dir, &settings.file);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| settings.level.clone());
    let env_filter = EnvFilter::try_new(filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}
