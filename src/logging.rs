/// Structured logging for the leak monitoring service
///
/// Provides context-rich logging with subsystem/sensor identifiers,
/// timestamps, and severity levels. Supports both console output
/// and file-based logging for daemon operations.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subsystem Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subsystem {
    Adc,
    Sensor,
    Monitor,
    Database,
    Slack,
    System,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Adc => write!(f, "ADC"),
            Subsystem::Sensor => write!(f, "SENSOR"),
            Subsystem::Monitor => write!(f, "MONITOR"),
            Subsystem::Database => write!(f, "DB"),
            Subsystem::Slack => write!(f, "SLACK"),
            Subsystem::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>) {
        let logger = Logger {
            min_level,
            log_file,
        };

        *LOGGER.lock().unwrap() = Some(logger);
    }

    /// Log a message with the global logger
    fn log(&self, level: LogLevel, subsystem: &Subsystem, sensor: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

        // Format the log entry
        let sensor_part = sensor.map(|s| format!(" [{}]", s)).unwrap_or_default();
        let log_entry = format!(
            "{} {} {}{}: {}",
            timestamp, level, subsystem, sensor_part, message
        );

        // Console output
        match level {
            LogLevel::Error | LogLevel::Warning => eprintln!("{}", log_entry),
            LogLevel::Info | LogLevel::Debug => println!("{}", log_entry),
        }

        // File output
        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>) {
    Logger::init(min_level, log_file.map(String::from));
}

/// Log a general informational message
pub fn info(subsystem: Subsystem, sensor: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Info, &subsystem, sensor, message);
    }
}

/// Log a warning message
pub fn warn(subsystem: Subsystem, sensor: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Warning, &subsystem, sensor, message);
    }
}

/// Log an error message
pub fn error(subsystem: Subsystem, sensor: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Error, &subsystem, sensor, message);
    }
}

/// Log a debug message
pub fn debug(subsystem: Subsystem, sensor: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Debug, &subsystem, sensor, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_logging_without_init_is_a_noop() {
        // Must not panic when the global logger was never initialized.
        debug(Subsystem::System, None, "uninitialized logger");
    }
}
