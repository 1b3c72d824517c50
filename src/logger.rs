//! Logging handle passed to each component at construction.
//!
//! Components log through a [`Logger`] instead of the global `log` macros so
//! tests can hand them a capturing sink. In the binary every handle forwards
//! to whatever `log` implementation `main` installed (env_logger).

use log::{Level, Log, Metadata, Record};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Cloneable logging capability with a fixed target.
#[derive(Clone)]
pub struct Logger {
    target: &'static str,
    sink: Arc<dyn Log>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("target", &self.target).finish()
    }
}

impl Logger {
    /// A logger that forwards to the process-wide `log` implementation.
    pub fn global() -> Self {
        Self::with_sink(Arc::new(GlobalLog))
    }

    /// A logger that keeps every record in memory, plus the handle to read them.
    pub fn capture() -> (Self, Arc<CapturedLog>) {
        let captured = Arc::new(CapturedLog::default());
        (Self::with_sink(captured.clone()), captured)
    }

    pub fn with_sink(sink: Arc<dyn Log>) -> Self {
        Logger {
            target: env!("CARGO_CRATE_NAME"),
            sink,
        }
    }

    /// Same sink, different target (one per component).
    pub fn for_target(&self, target: &'static str) -> Self {
        Logger {
            target,
            sink: self.sink.clone(),
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let metadata = Metadata::builder()
            .level(level)
            .target(self.target)
            .build();
        if !self.sink.enabled(&metadata) {
            return;
        }
        self.sink
            .log(&Record::builder().metadata(metadata).args(args).build());
    }
}

struct GlobalLog;

impl Log for GlobalLog {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        log::logger().log(record);
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

/// In-memory sink used by tests to assert on log output.
#[derive(Debug, Default)]
pub struct CapturedLog {
    records: Mutex<Vec<(Level, String, String)>>,
}

impl CapturedLog {
    /// Every captured line as `LEVEL target: message`.
    pub fn lines(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .map(|(level, target, message)| format!("{level} {target}: {message}"))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn count_at(&self, level: Level) -> usize {
        self.records
            .lock()
            .map(|records| records.iter().filter(|(l, _, _)| *l == level).count())
            .unwrap_or(0)
    }
}

impl Log for CapturedLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if let Ok(mut records) = self.records.lock() {
            records.push((
                record.level(),
                record.target().to_string(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_records_level_target_and_message() {
        let (logger, captured) = Logger::capture();
        let pipeline = logger.for_target("ruuvi_station::pipeline");

        pipeline.warn(format_args!("dropped frame from {}", "Ruuvi C2A9"));
        logger.debug(format_args!("tick"));

        assert_eq!(
            captured.lines(),
            vec![
                "WARN ruuvi_station::pipeline: dropped frame from Ruuvi C2A9".to_string(),
                "DEBUG ruuvi_station: tick".to_string(),
            ]
        );
        assert_eq!(captured.count_at(Level::Warn), 1);
        assert!(captured.contains("tick"));
    }
}
