//! Structured logging and poll metrics.
//!
//! Nothing is emitted until [`init_logger`] installs the process-wide
//! logger; before that the `aio_*!` macros cost one atomic load.

use crate::error::{AioError, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Per-event detail
    Trace = 0,
    /// Diagnostic detail
    Debug = 1,
    /// Lifecycle events
    Info = 2,
    /// Recoverable problems
    Warn = 3,
    /// Failures
    Error = 4,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One structured log line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Creation time
    pub timestamp: SystemTime,
    /// Severity
    pub level: LogLevel,
    /// Subsystem that emitted the record
    pub component: String,
    /// Descriptor slot the record concerns, if any
    pub slot: Option<usize>,
    /// File descriptor the record concerns, if any
    pub fd: Option<i32>,
    /// Message text
    pub message: String,
    /// Extra key/value pairs
    pub metadata: HashMap<String, String>,
    /// Measured duration for timing records
    pub duration: Option<Duration>,
}

impl LogRecord {
    /// Create a record with no optional fields set.
    pub fn new(level: LogLevel, component: &str, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            component: component.to_string(),
            slot: None,
            fd: None,
            message: message.to_string(),
            metadata: HashMap::new(),
            duration: None,
        }
    }

    /// Attach a descriptor slot.
    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attach a file descriptor.
    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Attach a metadata pair.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach a duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    fn millis(&self) -> u128 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    fn sorted_metadata(&self) -> Vec<(&String, &String)> {
        let mut pairs: Vec<_> = self.metadata.iter().collect();
        pairs.sort();
        pairs
    }

    /// Render as a single human-readable line.
    pub fn format(&self) -> String {
        let mut parts = vec![
            format!("[{}]", self.millis()),
            self.level.to_string(),
            self.component.clone(),
        ];

        if let Some(slot) = self.slot {
            parts.push(format!("slot:{slot}"));
        }
        if let Some(fd) = self.fd {
            parts.push(format!("fd:{fd}"));
        }
        parts.push(self.message.clone());
        if let Some(duration) = self.duration {
            parts.push(format!("duration:{}us", duration.as_micros()));
        }
        if !self.metadata.is_empty() {
            let pairs = self
                .sorted_metadata()
                .into_iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(",");
            parts.push(format!("metadata:{{{pairs}}}"));
        }

        parts.join(" ")
    }

    /// Render as a single JSON object.
    pub fn format_json(&self) -> String {
        let mut fields = vec![
            format!("\"timestamp\":{}", self.millis()),
            format!("\"level\":\"{}\"", self.level),
            format!("\"component\":\"{}\"", escape(&self.component)),
            format!("\"message\":\"{}\"", escape(&self.message)),
        ];

        if let Some(slot) = self.slot {
            fields.push(format!("\"slot\":{slot}"));
        }
        if let Some(fd) = self.fd {
            fields.push(format!("\"fd\":{fd}"));
        }
        if let Some(duration) = self.duration {
            fields.push(format!("\"duration_us\":{}", duration.as_micros()));
        }
        if !self.metadata.is_empty() {
            let pairs = self
                .sorted_metadata()
                .into_iter()
                .map(|(k, v)| format!("\"{}\":\"{}\"", escape(k), escape(v)))
                .collect::<Vec<_>>()
                .join(",");
            fields.push(format!("\"metadata\":{{{pairs}}}"));
        }

        format!("{{{}}}", fields.join(","))
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    /// Write one record.
    fn write(&self, record: &LogRecord) -> Result<()>;

    /// Flush buffered output.
    fn flush(&self) -> Result<()>;
}

/// Writes records to stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    json_format: bool,
}

impl ConsoleSink {
    /// Text output.
    pub fn new() -> Self {
        Self { json_format: false }
    }

    /// JSON output.
    pub fn new_json() -> Self {
        Self { json_format: true }
    }
}

impl LogSink for ConsoleSink {
    fn write(&self, record: &LogRecord) -> Result<()> {
        let line = if self.json_format {
            record.format_json()
        } else {
            record.format()
        };
        writeln!(std::io::stderr().lock(), "{line}")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        std::io::stderr().flush()?;
        Ok(())
    }
}

/// Appends records to a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    json_format: bool,
}

impl FileSink {
    /// Text output to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            json_format: false,
        }
    }

    /// JSON output to `path`.
    pub fn new_json<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            json_format: true,
        }
    }
}

impl LogSink for FileSink {
    fn write(&self, record: &LogRecord) -> Result<()> {
        let line = if self.json_format {
            record.format_json()
        } else {
            record.format()
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Opened and closed per write.
        Ok(())
    }
}

/// Process logger: a level filter, outputs and poll metrics.
pub struct Logger {
    min_level: LogLevel,
    sinks: Vec<Box<dyn LogSink>>,
    metrics_enabled: bool,
    metrics: Arc<Mutex<PollMetrics>>,
}

impl Logger {
    /// Logger writing `Info` and above to stderr, metrics off.
    pub fn new() -> Self {
        Self {
            min_level: LogLevel::Info,
            sinks: vec![Box::new(ConsoleSink::new())],
            metrics_enabled: false,
            metrics: Arc::new(Mutex::new(PollMetrics::new())),
        }
    }

    /// Minimum level that reaches the outputs.
    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    /// Set the minimum level.
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Turn timing collection on or off.
    pub fn set_metrics_enabled(&mut self, enabled: bool) {
        self.metrics_enabled = enabled;
    }

    /// Add an output.
    pub fn add_sink(&mut self, sink: Box<dyn LogSink>) {
        self.sinks.push(sink);
    }

    /// Replace all outputs.
    pub fn set_sinks(&mut self, sinks: Vec<Box<dyn LogSink>>) {
        self.sinks = sinks;
    }

    /// Whether a record at `level` would be written.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Log a plain message.
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if self.enabled(level) {
            self.write_record(&LogRecord::new(level, component, message));
        }
    }

    /// Log a message about one descriptor slot.
    pub fn log_slot(
        &self,
        level: LogLevel,
        component: &str,
        slot: usize,
        fd: Option<i32>,
        message: &str,
    ) {
        if self.enabled(level) {
            let mut record = LogRecord::new(level, component, message).with_slot(slot);
            if let Some(fd) = fd {
                record = record.with_fd(fd);
            }
            self.write_record(&record);
        }
    }

    /// Record a timing into metrics, and log it at `Debug`.
    pub fn log_timing(&self, component: &str, operation: &str, duration: Duration) {
        if self.metrics_enabled {
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.record(operation, duration);
            }
        }
        if self.enabled(LogLevel::Debug) {
            let record = LogRecord::new(LogLevel::Debug, component, &format!("{operation} completed"))
                .with_duration(duration);
            self.write_record(&record);
        }
    }

    /// Log an error with context.
    pub fn log_error(&self, component: &str, error: &AioError, context: &str) {
        self.log(LogLevel::Error, component, &format!("{context}: {error}"));
    }

    fn write_record(&self, record: &LogRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.write(record) {
                eprintln!("Failed to write log record: {e}");
            }
        }
    }

    /// Flush all outputs.
    pub fn flush(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                eprintln!("Failed to flush log output: {e}");
            }
        }
    }

    /// Snapshot of collected metrics.
    pub fn metrics(&self) -> Result<PollMetrics> {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .map_err(|_| AioError::PoolPoisoned)
    }

    /// Clear collected metrics.
    pub fn reset_metrics(&self) -> Result<()> {
        self.metrics
            .lock()
            .map(|mut m| m.reset())
            .map_err(|_| AioError::PoolPoisoned)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.min_level)
            .field("sinks", &self.sinks.len())
            .field("metrics_enabled", &self.metrics_enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

/// Per-operation timing aggregates.
#[derive(Debug, Clone)]
pub struct PollMetrics {
    timings: HashMap<String, Timing>,
    start_time: Instant,
}

impl PollMetrics {
    /// Empty metrics starting now.
    pub fn new() -> Self {
        Self {
            timings: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Add one sample for `operation`.
    pub fn record(&mut self, operation: &str, duration: Duration) {
        let timing = self
            .timings
            .entry(operation.to_string())
            .or_insert(Timing {
                count: 0,
                total: Duration::ZERO,
                min: duration,
                max: duration,
            });
        timing.count += 1;
        timing.total += duration;
        timing.min = timing.min.min(duration);
        timing.max = timing.max.max(duration);
    }

    /// Samples recorded for `operation`.
    pub fn count(&self, operation: &str) -> u64 {
        self.timings.get(operation).map_or(0, |t| t.count)
    }

    /// Mean duration for `operation`.
    pub fn average(&self, operation: &str) -> Option<Duration> {
        self.timings
            .get(operation)
            .filter(|t| t.count > 0)
            .map(|t| t.total / t.count as u32)
    }

    /// Shortest sample for `operation`.
    pub fn min(&self, operation: &str) -> Option<Duration> {
        self.timings.get(operation).map(|t| t.min)
    }

    /// Longest sample for `operation`.
    pub fn max(&self, operation: &str) -> Option<Duration> {
        self.timings.get(operation).map(|t| t.max)
    }

    /// Operation names with at least one sample, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<_> = self.timings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Samples across all operations.
    pub fn total(&self) -> u64 {
        self.timings.values().map(|t| t.count).sum()
    }

    /// Time since collection started or was last reset.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Drop all samples.
    pub fn reset(&mut self) {
        self.timings.clear();
        self.start_time = Instant::now();
    }

    /// Multi-line summary.
    pub fn report(&self) -> String {
        let mut report = String::from("=== safer-aio poll metrics ===\n");
        report.push_str(&format!("Collection Duration: {:?}\n", self.elapsed()));
        report.push_str(&format!("Total Samples: {}\n\n", self.total()));

        for operation in self.operations() {
            report.push_str(&format!("Operation: {operation}\n"));
            report.push_str(&format!("  Count: {}\n", self.count(&operation)));
            if let Some(avg) = self.average(&operation) {
                report.push_str(&format!("  Average: {avg:?}\n"));
            }
            if let (Some(min), Some(max)) = (self.min(&operation), self.max(&operation)) {
                report.push_str(&format!("  Min: {min:?}\n  Max: {max:?}\n"));
            }
            report.push('\n');
        }
        report
    }
}

impl Default for PollMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_LOGGER: OnceLock<Arc<Mutex<Logger>>> = OnceLock::new();

/// Install the process-wide logger if needed and return it.
pub fn init_logger() -> Arc<Mutex<Logger>> {
    GLOBAL_LOGGER
        .get_or_init(|| Arc::new(Mutex::new(Logger::new())))
        .clone()
}

/// The process-wide logger, if [`init_logger`] has run.
pub fn global_logger() -> Option<Arc<Mutex<Logger>>> {
    GLOBAL_LOGGER.get().cloned()
}

fn with_logger(f: impl FnOnce(&Logger)) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            f(&logger);
        }
    }
}

/// Log through the process-wide logger.
pub fn log(level: LogLevel, component: &str, message: &str) {
    with_logger(|l| l.log(level, component, message));
}

/// Log about a descriptor slot through the process-wide logger.
pub fn log_slot(level: LogLevel, component: &str, slot: usize, fd: Option<i32>, message: &str) {
    with_logger(|l| l.log_slot(level, component, slot, fd, message));
}

/// Record a timing through the process-wide logger.
pub fn log_timing(component: &str, operation: &str, duration: Duration) {
    with_logger(|l| l.log_timing(component, operation, duration));
}

/// Whether the process-wide logger would write at `level`.
pub fn enabled(level: LogLevel) -> bool {
    GLOBAL_LOGGER
        .get()
        .and_then(|l| l.lock().ok().map(|l| l.enabled(level)))
        .unwrap_or(false)
}

/// Whether timing should be measured at all.
pub(crate) fn timing_wanted() -> bool {
    GLOBAL_LOGGER
        .get()
        .and_then(|l| {
            l.lock()
                .ok()
                .map(|l| l.metrics_enabled || l.enabled(LogLevel::Debug))
        })
        .unwrap_or(false)
}

/// Log at `Trace` through the process-wide logger.
#[macro_export]
macro_rules! aio_trace {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Trace) {
            $crate::logging::log($crate::logging::LogLevel::Trace, $component, &format!($($arg)*))
        }
    };
}

/// Log at `Debug` through the process-wide logger.
#[macro_export]
macro_rules! aio_debug {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Debug) {
            $crate::logging::log($crate::logging::LogLevel::Debug, $component, &format!($($arg)*))
        }
    };
}

/// Log at `Info` through the process-wide logger.
#[macro_export]
macro_rules! aio_info {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Info, $component, &format!($($arg)*))
    };
}

/// Log at `Warn` through the process-wide logger.
#[macro_export]
macro_rules! aio_warn {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Warn, $component, &format!($($arg)*))
    };
}

/// Log at `Error` through the process-wide logger.
#[macro_export]
macro_rules! aio_error {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Error, $component, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Capture(Arc<Mutex<Vec<String>>>);

    impl LogSink for Capture {
        fn write(&self, record: &LogRecord) -> Result<()> {
            self.0.lock().unwrap().push(record.format());
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn record_builder_sets_fields() {
        let record = LogRecord::new(LogLevel::Warn, "poller", "sync failed")
            .with_slot(7)
            .with_fd(4)
            .with_metadata("errno", "5")
            .with_duration(Duration::from_micros(250));

        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.slot, Some(7));
        assert_eq!(record.fd, Some(4));
        assert_eq!(record.metadata.get("errno"), Some(&"5".to_string()));

        let text = record.format();
        assert!(text.contains("WARN poller slot:7 fd:4 sync failed"));
        assert!(text.contains("duration:250us"));
        assert!(text.contains("metadata:{errno:5}"));
    }

    #[test]
    fn json_escapes_quotes() {
        let json = LogRecord::new(LogLevel::Info, "context", "opened \"journal\"").format_json();
        assert!(json.contains("\"level\":\"INFO\""));
        assert!(json.contains("\"message\":\"opened \\\"journal\\\"\""));
        assert!(json.starts_with('{') && json.ends_with('}'));
    }

    #[test]
    fn level_filter_applies_to_sinks() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut logger = Logger::new();
        logger.set_sinks(vec![Box::new(Capture(Arc::clone(&lines)))]);
        logger.set_level(LogLevel::Warn);

        logger.log(LogLevel::Info, "test", "dropped");
        logger.log(LogLevel::Error, "test", "kept");
        logger.log_slot(LogLevel::Warn, "test", 3, None, "also kept");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("kept"));
        assert!(lines[1].contains("slot:3"));
    }

    #[test]
    fn metrics_only_collected_when_enabled() {
        let mut logger = Logger::new();
        logger.set_sinks(Vec::new());

        logger.log_timing("poller", "poll", Duration::from_millis(1));
        assert_eq!(logger.metrics().unwrap().total(), 0);

        logger.set_metrics_enabled(true);
        logger.log_timing("poller", "poll", Duration::from_millis(10));
        logger.log_timing("poller", "poll", Duration::from_millis(20));
        logger.log_timing("poller", "blocking_poll", Duration::from_millis(5));

        let metrics = logger.metrics().unwrap();
        assert_eq!(metrics.count("poll"), 2);
        assert_eq!(metrics.average("poll"), Some(Duration::from_millis(15)));
        assert_eq!(metrics.min("poll"), Some(Duration::from_millis(10)));
        assert_eq!(metrics.max("poll"), Some(Duration::from_millis(20)));
        assert_eq!(metrics.operations(), vec!["blocking_poll", "poll"]);
        assert!(metrics.report().contains("Operation: poll"));

        logger.reset_metrics().unwrap();
        assert_eq!(logger.metrics().unwrap().total(), 0);
    }

    #[test]
    fn file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aio.log");
        let sink = FileSink::new_json(&path);

        sink.write(&LogRecord::new(LogLevel::Info, "test", "one")).unwrap();
        sink.write(&LogRecord::new(LogLevel::Info, "test", "two")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"message\":\"two\""));
    }

    #[test]
    fn global_functions_do_not_panic() {
        let _logger = init_logger();
        log(LogLevel::Info, "test", "message");
        log_slot(LogLevel::Debug, "test", 1, Some(4), "slot message");
        log_timing("test", "poll", Duration::from_millis(1));
        crate::aio_warn!("test", "value {}", 42);
        assert!(global_logger().is_some());
    }
}
