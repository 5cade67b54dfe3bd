//! Structured logging setup.
//!
//! Priority for the filter: `RUST_LOG` > `logging.level` > "info".
//! Output is pretty or JSON per `logging.format`; when `logging.dir` is set a
//! daily rolling JSON file is written alongside.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Initialize the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so buffered file logs are flushed.
pub fn init(logging: &LoggingSection, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let default_filter = format!("{level},triage={level}");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let stderr_layer = match logging.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();

    guard
}
