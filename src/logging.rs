//! Logging initialization: `tracing` + `tracing-subscriber` +
//! `tracing-appender`, driven entirely by the global
//! `--log-level`/`--log-format`/`--log-output` flags.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Kept alive for the duration of the program; dropping it flushes any
/// buffered file-backed log writer.
pub struct LoggingHandle {
    _guard: Option<WorkerGuard>,
}

/// `--log-output stderr|stdout|<path>`, `--log-level`, `--log-format`.
pub fn init_logging(log_level: &str, log_format: LogFormat, log_output: &str) -> Result<LoggingHandle> {
    let filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match log_output {
        "stderr" => init_with_writer(filter, log_format, std::io::stderr, None),
        "stdout" => init_with_writer(filter, log_format, std::io::stdout, None),
        path => {
            let path = PathBuf::from(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir).context("creating log output directory")?;
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "ticketflow.log".to_string());
            let dir = dir.unwrap_or_else(|| std::path::Path::new("."));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            init_with_writer(filter, log_format, non_blocking, Some(guard))
        }
    }
}

fn init_with_writer<W>(
    filter: EnvFilter,
    log_format: LogFormat,
    writer: W,
    guard: Option<WorkerGuard>,
) -> Result<LoggingHandle>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);

    match log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        }
        LogFormat::Text => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(writer),
                )
                .init();
        }
    }

    Ok(LoggingHandle { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
