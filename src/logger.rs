//! Minimal logger behind the [`log`] facade. Every record is printed with a
//! timestamp, the level and the `file:line` that produced it, which is enough
//! context to trace an I/O error back to the event-loop branch that hit it.

use chrono::Utc;
pub use log::{Level, LevelFilter, SetLoggerError};

pub struct Logger {
    label: Option<&'static str>,
    level: Level,
}

impl Logger {
    pub fn new() -> Self {
        Logger {
            label: None,
            level: Level::Info,
        }
    }

    /// Installs this logger as the global one. Must be called once, before
    /// the first record is emitted.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self)).map(|()| log::set_max_level(level.to_level_filter()))
    }

    /// Program name shown in front of every record.
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let location = match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            _ => String::from("<unknown>"),
        };

        match self.label {
            Some(label) => println!(
                "{timestamp} {} {label} [{location}] {}",
                record.level(),
                record.args()
            ),
            None => println!(
                "{timestamp} {} [{location}] {}",
                record.level(),
                record.args()
            ),
        }
    }

    fn flush(&self) {}
}
