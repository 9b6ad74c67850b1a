use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Minimum number of rotated files kept when a log file is configured.
const MIN_RETAINED_LOG_FILES: usize = 2;

/// Rough per-file size used to translate a byte budget into a retained-file
/// count. Rotation is daily; a hard per-file size cap is not enforced.
const APPROX_LOG_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Wrapper for the tracing subscriber, holding the non-blocking file writer
/// guard so buffered log lines are flushed on drop.
pub struct Telemetry {
    _file_guard: Option<WorkerGuard>,
}

impl Telemetry {
    /// Initializes the global tracing subscriber.
    ///
    /// Log lines always go to stdout. When `log_file` is set, a second layer
    /// writes to a daily-rotated file next to the given path; the retained
    /// history is bounded by `max_log_file_size` bytes.
    ///
    /// The filter is taken from `RUST_LOG`, defaulting to `info`.
    pub fn init(log_file: Option<&Path>, max_log_file_size: u64) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let (file_layer, file_guard) = match log_file {
            Some(path) => {
                let directory = path.parent().unwrap_or_else(|| Path::new("."));
                let prefix = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "agent-host.log".to_string());
                let retained = ((max_log_file_size / APPROX_LOG_FILE_SIZE) as usize)
                    .max(MIN_RETAINED_LOG_FILES);
                let appender = RollingFileAppender::builder()
                    .rotation(Rotation::DAILY)
                    .filename_prefix(prefix)
                    .max_log_files(retained)
                    .build(directory)
                    .expect("failed to create log file appender");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(file_layer)
            .init();

        Self {
            _file_guard: file_guard,
        }
    }
}
