//! File logging for the ravel runtime.
//!
//! Log levels:
//! - ERROR: Unobserved task faults, scheduler invariant violations
//! - WARN: Task faults, rejected submissions
//! - INFO: CLI runs
//! - DEBUG: Scheduler lifecycle, chain starts, graph merges
//! - TRACE: Per-task state transitions and pump ticks
//!
//! Nothing is written until [`init`] picked a file. `--debug` or
//! `RAVEL_DEBUG=1` lowers the threshold to DEBUG.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// Whether a message at this level would be written.
    pub fn enabled(self) -> bool {
        LOG_PATH.get().is_some() && self as u8 <= THRESHOLD.load(Ordering::Relaxed)
    }
}

fn env_debug() -> bool {
    std::env::var("RAVEL_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Start a fresh `~/.ravel/ravel.log`.
pub fn init(debug: bool) {
    let threshold = if debug || env_debug() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    THRESHOLD.store(threshold as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".ravel")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("ravel.log");
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

/// One line: time, level, thread name, message. The thread name matters
/// here since most lines come from `ravel-ui`, `ravel-exclusive` or a pool
/// worker.
#[doc(hidden)]
pub fn write(level: LogLevel, args: fmt::Arguments<'_>) {
    let Some(path) = LOG_PATH.get() else { return };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let thread = std::thread::current();
        let _ = writeln!(
            file,
            "[{}] [{}] [{}] {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            level.label(),
            thread.name().unwrap_or("-"),
            args
        );
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! rlog_at {
    ($level:expr, $($arg:tt)*) => {
        if $level.enabled() {
            $crate::log::write($level, format_args!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => { $crate::rlog_at!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => { $crate::rlog_at!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => { $crate::rlog_at!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => { $crate::rlog_at!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => { $crate::rlog_at!($crate::log::LogLevel::Trace, $($arg)*) };
}
