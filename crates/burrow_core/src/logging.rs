//! Logging setup and the lifecycle line format.
//!
//! Provides:
//! - `LifecycleFormat`, rendering `<timestamp> | ClickHouse → <message>`
//! - Console output on stdout or stderr, plus an optional daily rotating log file
//! - Environment variable override via BURROW_LOG or RUST_LOG

use std::path::PathBuf;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Prefix every lifecycle line carries after the timestamp.
pub const LINE_PREFIX: &str = "ClickHouse →";

/// Event format for lifecycle lines.
///
/// INFO, WARN and ERROR events render as
/// `2024-05-01 12:00:00.123456 | ClickHouse → select: START`.
/// DEBUG and TRACE events additionally carry their level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LifecycleFormat;

impl<S, N> FormatEvent<S, N> for LifecycleFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} | {LINE_PREFIX} ", now.format("%Y-%m-%d %H:%M:%S%.6f"))?;

        let level = *event.metadata().level();
        if level > Level::INFO {
            write!(writer, "[{level}] ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Console stream log lines are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleStream {
    #[default]
    Stdout,
    /// Keeps stdout free for command output
    Stderr,
}

impl ConsoleStream {
    fn make_writer(self) -> BoxMakeWriter {
        match self {
            Self::Stdout => BoxMakeWriter::new(std::io::stdout),
            Self::Stderr => BoxMakeWriter::new(std::io::stderr),
        }
    }

    fn is_terminal(self) -> bool {
        match self {
            Self::Stdout => atty::is(atty::Stream::Stdout),
            Self::Stderr => atty::is(atty::Stream::Stderr),
        }
    }
}

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files (None = console only)
    pub log_dir: Option<PathBuf>,
    /// Console stream for log lines
    pub console: ConsoleStream,
    /// Whether the console stream is a terminal (enables ANSI colors)
    pub is_pty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a console-only logging configuration writing to stdout.
    pub fn new() -> Self {
        Self {
            log_dir: None,
            console: ConsoleStream::Stdout,
            is_pty: ConsoleStream::Stdout.is_terminal(),
            log_filter: None,
        }
    }

    /// Write console log lines to `console` instead.
    pub fn with_console(mut self, console: ConsoleStream) -> Self {
        self.console = console;
        self.is_pty = console.is_terminal();
        self
    }

    /// Also write to daily rotating files in `log_dir`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that must be held for the lifetime of the application.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Initialize logging with the given configuration.
///
/// If file logging initialization fails, falls back to console-only.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.log_dir.is_none() {
        return init_console_logging(&config);
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {e}. Using console only.");
            init_console_logging(&config)
        }
    }
}

/// Initialize console-only logging.
fn init_console_logging(config: &LogConfig) -> LoggingGuard {
    let env_filter = build_env_filter(config.log_filter.as_deref());

    let result = tracing_subscriber::fmt()
        .with_writer(config.console.make_writer())
        .with_env_filter(env_filter)
        .with_ansi(config.is_pty)
        .event_format(LifecycleFormat)
        .try_init();
    if let Err(e) = result {
        eprintln!("Warning: Logging already initialized: {e}");
    }

    LoggingGuard { _worker_guard: None }
}

/// Initialize file + console logging.
fn init_file_logging(config: &LogConfig) -> Result<WorkerGuard, InitError> {
    let (subscriber, guard) = file_subscriber(config)?;
    subscriber.try_init()?;
    Ok(guard)
}

/// Build a subscriber writing to the console and to daily files in `config.log_dir`.
fn file_subscriber(
    config: &LogConfig,
) -> Result<(impl Subscriber + Send + Sync + 'static, WorkerGuard), InitError> {
    let log_dir = config.log_dir.as_ref().ok_or("no log directory configured")?;
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("burrow")
        .filename_suffix("log")
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console = config.console.make_writer().with_max_level(Level::INFO);
    let combined = console.and(non_blocking);

    let env_filter = build_env_filter(config.log_filter.as_deref());

    let subscriber = tracing_subscriber::fmt()
        .with_writer(combined)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .event_format(LifecycleFormat)
        .finish();

    Ok((subscriber, guard))
}

/// Build the environment filter from config or defaults.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    // Priority: custom filter > BURROW_LOG > RUST_LOG > default
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env("BURROW_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,burrow=debug,burrow_core=debug,russh=warn,klickhouse=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,russh=warn,klickhouse=warn"
    }
}

/// Get the default log directory, used when file logging is requested without one.
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("burrow")
        .join("logs")
}

#[cfg(test)]
pub(crate) mod capture {
    //! In-memory log capture for tests.

    use super::LifecycleFormat;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use tracing::Level;

    /// Shared buffer implementing `io::Write`.
    #[derive(Clone, Default)]
    pub(crate) struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with a thread-local subscriber and return what it logged.
    pub(crate) fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .event_format(LifecycleFormat)
            .finish();

        let result = tracing::subscriber::with_default(subscriber, f);
        let output = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
        (result, output)
    }
}

#[cfg(test)]
mod tests {
    use super::capture::capture_logs;
    use super::*;

    #[test]
    fn test_lifecycle_line_format() {
        let ((), output) = capture_logs(|| {
            tracing::info!("select: START");
            tracing::warn!("connect: WARNING → already established");
        });

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let (timestamp, rest) = lines[0].split_once(" | ").unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S%.f").is_ok());
        assert_eq!(rest, "ClickHouse → select: START");
        assert!(lines[1].ends_with("| ClickHouse → connect: WARNING → already established"));
    }

    #[test]
    fn test_structured_fields_follow_message() {
        let ((), output) = capture_logs(|| {
            tracing::info!(database = "events", "connect: SUCCESS");
        });
        assert!(output.contains("ClickHouse → connect: SUCCESS database=\"events\""));
    }

    #[test]
    fn test_debug_events_filtered_by_capture() {
        let ((), output) = capture_logs(|| tracing::debug!("noise"));
        assert!(output.is_empty());
    }

    #[test]
    fn test_file_logging_writes_lifecycle_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LogConfig::new()
            .with_console(ConsoleStream::Stderr)
            .with_log_dir(&log_dir)
            .with_filter("info");

        let (subscriber, guard) = file_subscriber(&config).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("select: START");
            tracing::debug!("filtered out");
        });
        drop(guard);

        let files: Vec<_> =
            std::fs::read_dir(&log_dir).unwrap().map(|entry| entry.unwrap().path()).collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("burrow") && name.ends_with(".log"));

        let contents = std::fs::read_to_string(&files[0]).unwrap();
        assert!(contents.contains("| ClickHouse → select: START"));
        assert!(!contents.contains("filtered out"));
    }

    #[test]
    fn test_file_logging_requires_dir() {
        assert!(file_subscriber(&LogConfig::new()).is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(default_log_filter()).is_ok());
        assert!(log_dir().ends_with("burrow/logs"));
    }
}
