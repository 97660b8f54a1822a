use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. With a log file, output goes
/// through a non-blocking writer; keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&logging.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", logging.level, e))?;

  let (layer, guard) = match &logging.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();
      (layer, Some(guard))
    }
    None => (
      fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_target(true)
        .boxed(),
      None,
    ),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
