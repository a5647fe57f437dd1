use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::writer::BoxMakeWriter, prelude::*, EnvFilter, Layer, Registry,
};

const LOG_ENV: &str = "TDQ_LOG";
const DEFAULT_LOG_FILTER: &str = "tdq=info";
const LOG_FILE_PREFIX: &str = "tdq.log";

/// Installs the global subscriber. Logs go to stderr, or to daily-rotated files under
/// `log_dir`; the returned guard must be held until exit so file logs are flushed.
pub fn init(json: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(writer);
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
        Box::new(fmt_layer.json())
    } else {
        Box::new(fmt_layer)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;

    Ok(guard)
}
