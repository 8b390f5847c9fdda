//! Logger initialization
//!
//! Installs a global `tracing` subscriber from the `logging` section of the
//! configuration. Text records look like
//! `2024-05-01T10:00:00.000000Z [INFO] TCP proxy started on 0.0.0.0:8080`,
//! JSON records are `{"level":"INFO","message":"..."}`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

use crate::config::{LogFormat, LogLevel, LogOutput, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file {}: {source}", .path.display())]
    OpenLogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("logging.file_path is required when logging.output is file")]
    MissingFilePath,

    #[error("failed to install log subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the process-wide subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    match config.output {
        LogOutput::Stdout => install(config, std::io::stdout),
        LogOutput::File => {
            let path = config
                .file_path
                .as_deref()
                .ok_or(LoggingError::MissingFilePath)?;
            install(config, Mutex::new(open_log_file(path)?))
        }
    }
}

/// Open `path` for appending, creating it if missing.
pub fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::OpenLogFile {
            path: path.to_path_buf(),
            source,
        })
}

fn install<W>(config: &LoggingConfig, writer: W) -> Result<(), LoggingError>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing::subscriber::set_global_default(build_subscriber(config, writer))?;
    Ok(())
}

/// Build (without installing) a subscriber writing to `writer`.
pub fn build_subscriber<W>(config: &LoggingConfig, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let level = level_filter(config.level);

    match config.format {
        LogFormat::Text => Box::new(
            tracing_subscriber::fmt()
                .event_format(BracketedFormat)
                .with_max_level(level)
                .with_writer(writer)
                .finish(),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_target(false)
                .without_time()
                .with_max_level(level)
                .with_writer(writer)
                .finish(),
        ),
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

/// `<timestamp> [LEVEL] message`
struct BracketedFormat;

impl<S, N> FormatEvent<S, N> for BracketedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        SystemTime.format_time(&mut writer)?;
        write!(writer, " [{}] ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
