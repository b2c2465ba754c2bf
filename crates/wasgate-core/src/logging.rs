//! Structured logging for the gateway.
//!
//! Log entries carry a level, a target module path, a message, and optional
//! structured fields. Output is either JSON (production) or a compact
//! single-line format (development), written to stderr or a file through a
//! mutex-guarded sink so reactor and worker threads never interleave lines.
//!
//! The global level is an atomic read on the fast path; disabled levels cost
//! one load and no allocation.
//!
//! # Usage
//!
//! ```ignore
//! log_info!("fastcgi listening on {}", addr);
//! log_debug!("accepted fd={}", fd);
//!
//! // Structured fields:
//! LogEntry::new(LogLevel::Warn, "request timed out")
//!     .field("request_id", id)
//!     .field("elapsed_ms", elapsed.as_millis())
//!     .emit();
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Log severity, ordered from most verbose to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Most verbose, for detailed debugging.
    Trace = 0,
    /// Debug information, not shown in production.
    Debug = 1,
    /// General information about normal operation.
    Info = 2,
    /// Something unexpected but recoverable.
    Warn = 3,
    /// An error that affected processing.
    Error = 4,
}

impl LogLevel {
    /// Returns the level as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Returns a single character representation.
    #[must_use]
    pub const fn as_char(&self) -> char {
        match self {
            Self::Trace => 'T',
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
        }
    }

    /// Maps the config's numeric verbosity (0 error .. 3 trace) to the
    /// minimum emitted level.
    #[must_use]
    pub fn from_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0 => Self::Error,
            1 => Self::Info,
            2 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static GLOBAL_LOG_LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::Info as usize);
static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);
static SINK: Mutex<Option<File>> = Mutex::new(None);

/// Returns the current global log level.
#[inline]
#[must_use]
pub fn global_log_level() -> LogLevel {
    match GLOBAL_LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Trace,
        1 => LogLevel::Debug,
        2 => LogLevel::Info,
        3 => LogLevel::Warn,
        _ => LogLevel::Error,
    }
}

/// Sets the global log level.
pub fn set_global_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as usize, Ordering::Relaxed);
}

/// Returns true if the given level would be emitted.
#[inline]
#[must_use]
pub fn level_enabled(level: LogLevel) -> bool {
    level >= global_log_level()
}

/// Configures the sink and output format.
///
/// `destination` is `"stderr"` (or empty) for stderr, anything else is
/// opened for appending; on open failure the sink falls back to stderr.
pub fn init(destination: &str, json: bool) {
    JSON_OUTPUT.store(json, Ordering::Relaxed);
    let mut sink = SINK.lock();
    *sink = if destination.is_empty() || destination == "stderr" {
        None
    } else {
        OpenOptions::new().create(true).append(true).open(destination).ok()
    };
}

/// A log entry under construction.
#[derive(Debug)]
pub struct LogEntry {
    /// The log level.
    pub level: LogLevel,
    /// The log message.
    pub message: String,
    /// Module/target path (optional).
    pub target: Option<String>,
    /// Structured key-value fields (max 16).
    pub fields: Vec<(String, String)>,
    /// Nanoseconds since the UNIX epoch at construction.
    pub timestamp_ns: u128,
}

impl LogEntry {
    /// Creates a new entry.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            target: None,
            fields: Vec::new(),
            timestamp_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos()),
        }
    }

    /// Sets the target module path.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Adds a structured field. Fields beyond 16 are silently dropped.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        if self.fields.len() < 16 {
            self.fields.push((key.into(), value.to_string()));
        }
        self
    }

    /// Formats the entry as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut json = format!(
            r#"{{"timestamp_ns":{},"level":"{}","message":"{}""#,
            self.timestamp_ns,
            self.level,
            escape_json(&self.message),
        );
        if let Some(ref target) = self.target {
            json.push_str(&format!(r#","target":"{}""#, escape_json(target)));
        }
        if !self.fields.is_empty() {
            json.push_str(r#","fields":{"#);
            for (i, (k, v)) in self.fields.iter().enumerate() {
                if i > 0 {
                    json.push(',');
                }
                json.push_str(&format!(r#""{}":"{}""#, escape_json(k), escape_json(v)));
            }
            json.push('}');
        }
        json.push('}');
        json
    }

    /// Formats the entry in compact single-line form.
    #[must_use]
    pub fn to_compact(&self) -> String {
        let mut output = format!("[{}] {}", self.level.as_char(), self.message);
        if !self.fields.is_empty() {
            output.push_str(" {");
            for (i, (k, v)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push_str(", ");
                }
                output.push_str(&format!("{k}={v}"));
            }
            output.push('}');
        }
        output
    }

    /// Writes the entry to the configured sink if its level is enabled.
    pub fn emit(self) {
        if !level_enabled(self.level) {
            return;
        }
        let line = if JSON_OUTPUT.load(Ordering::Relaxed) {
            self.to_json()
        } else {
            self.to_compact()
        };
        let mut sink = SINK.lock();
        match sink.as_mut() {
            Some(file) => {
                let _ = writeln!(file, "{line}");
            }
            None => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
        }
    }
}

/// Escapes a string for JSON output.
fn escape_json(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

/// Builds and emits an entry; the macros funnel through here.
pub fn log(level: LogLevel, target: &'static str, args: fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    LogEntry::new(level, args.to_string()).target(target).emit();
}

/// Logs at TRACE level.
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Trace, module_path!(), format_args!($($arg)*))
    };
}

/// Logs at DEBUG level.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Debug, module_path!(), format_args!($($arg)*))
    };
}

/// Logs at INFO level.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Info, module_path!(), format_args!($($arg)*))
    };
}

/// Logs at WARN level.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Warn, module_path!(), format_args!($($arg)*))
    };
}

/// Logs at ERROR level.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Error, module_path!(), format_args!($($arg)*))
    };
}
