//! Leveled stderr logging for the network layer and applications.
//!
//! Every log site names a component tag (`"net"`, `"bounce"`, `"collatz"`),
//! and a thread-local node tag distinguishes nodes when several run in one
//! process (the simulated hub does exactly that).
//!
//! # Environment variables
//!
//! - `TL_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `TL_LOG_TIME=1` - include a microsecond timestamp
//! - `TL_LOG_FLUSH=1` - flush stderr after each line
//!
//! # Output format
//!
//! `[WARN ] [n17] net: no response to status probe`

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use crate::env::env_get_bool;

/// Log levels, lowest severity last.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize from environment variables. Runs automatically on first log;
/// call explicitly for deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START_TIME.get_or_init(Instant::now);
    FLUSH_ENABLED.store(env_get_bool("TL_LOG_FLUSH", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("TL_LOG_TIME", false), Ordering::Relaxed);

    if let Ok(val) = std::env::var("TL_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Current log level.
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (tests silence output this way).
pub fn set_log_level(level: LogLevel) {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether a level is enabled.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

thread_local! {
    static NODE_TAG: std::cell::Cell<Option<u8>> = const { std::cell::Cell::new(None) };
}

/// Tag this thread's log lines with a node id. Each node's service threads
/// set this at spawn.
pub fn set_node_tag(id: u8) {
    NODE_TAG.with(|t| t.set(Some(id)));
}

/// Remove the node tag from this thread.
pub fn clear_node_tag() {
    NODE_TAG.with(|t| t.set(None));
}

/// This thread's node tag, if set.
pub fn node_tag() -> Option<u8> {
    NODE_TAG.with(|t| t.get())
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, tag: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();

    let _ = write!(handle, "{} ", level.prefix());
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let start = START_TIME.get_or_init(Instant::now);
        let _ = write!(handle, "[{:>9}us] ", start.elapsed().as_micros());
    }
    match node_tag() {
        Some(id) => {
            let _ = write!(handle, "[n{:02X}] ", id);
        }
        None => {
            let _ = write!(handle, "[n--] ");
        }
    }
    let _ = write!(handle, "{}: ", tag);
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");

    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log.
#[macro_export]
macro_rules! loge {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Error, $tag, format_args!($($arg)*));
    }};
}

/// Warning level log.
#[macro_export]
macro_rules! logw {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Warn, $tag, format_args!($($arg)*));
    }};
}

/// Info level log.
#[macro_export]
macro_rules! logi {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Info, $tag, format_args!($($arg)*));
    }};
}

/// Debug level log.
#[macro_export]
macro_rules! logd {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Debug, $tag, format_args!($($arg)*));
    }};
}

/// Trace level log.
#[macro_export]
macro_rules! logt {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Trace, $tag, format_args!($($arg)*));
    }};
}
