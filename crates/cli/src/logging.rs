//! Log setup for the `burrow` binary.
//!
//! Two layers share one `EnvFilter`: a daily rolling file under
//! `~/.local/state/burrow/` that always records everything the filter lets
//! through, and a stderr layer in the format picked with `--log-format`.

use std::io::Write;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// The directory under the platform state dir where logs are stored.
const LOG_DIR_NAME: &str = "burrow";

/// The base filename for the rolling log file.
const LOG_FILE_NAME: &str = "burrow.log";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for machine parsing
    Json,
}

/// A writer that wraps stderr and flushes after each write.
/// This keeps log lines visible when stderr is piped.
struct FlushingStderr;

impl Write for FlushingStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let n = handle.write(buf)?;
        handle.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

/// Build the filter: `RUST_LOG` wins, otherwise `level`. SSH internals stay
/// at `warn` unless `RUST_LOG` names them.
fn build_filter(level: &str) -> EnvFilter {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if rust_log.contains("russh") || rust_log.contains("ssh_key") {
        return filter;
    }
    ["russh=warn", "russh_keys=warn", "ssh_key=warn"]
        .into_iter()
        .filter_map(|d| d.parse().ok())
        .fold(filter, |f, directive| f.add_directive(directive))
}

/// Initialise the tracing subscriber with file + stderr layers.
///
/// Returns a [`WorkerGuard`] that **must** be held for the lifetime of the
/// program. Dropping it flushes and closes the log file writer.
pub fn init_logging(level: &str, format: LogFormat) -> WorkerGuard {
    let log_dir = log_directory();

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: could not create log directory {}: {e}",
            log_dir.display()
        );
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let use_color = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let stderr_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(|| FlushingStderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(use_color)
            .with_target(false)
            .with_writer(|| FlushingStderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(use_color)
            .with_target(true)
            .with_writer(|| FlushingStderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

/// Resolve the log directory path.
///
/// Uses `dirs::state_dir()` (`~/.local/state/burrow/` on Linux). Falls back to
/// the same layout under the home directory, then the current directory.
fn log_directory() -> PathBuf {
    if let Some(state) = dirs::state_dir() {
        return state.join(LOG_DIR_NAME);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("state").join(LOG_DIR_NAME);
    }
    PathBuf::from(".")
}
