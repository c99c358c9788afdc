//! Leveled stderr logging shared by the dispatcher and its workers.
//!
//! Parent and workers write to the same stderr, so every leveled line
//! carries the writing process id:
//!
//! ```text
//! [INFO]  [4711] worker 4712 spawned (pool 1/10)
//! [WARN]  [4712] bad SCGI header: missing ',' after header block
//! ```
//!
//! Settings are read from the environment on first use:
//!
//! - `SCGI_LOG_LEVEL` - `off`, `error`, `warn`, `info` (default), `debug`,
//!   `trace`, or the digits 0-5
//! - `SCGI_FLUSH_EPRINT=1` - flush after every line, so nothing is lost when
//!   a process aborts
//!
//! Workers inherit whatever the parent resolved before fork.
//!
//! ```ignore
//! use scgi_core::{kdebug, kerror, kinfo};
//!
//! kinfo!("listening on {}", addr);
//! kdebug!("worker {} went away before handoff", pid);
//! kerror!("fatal dispatch error: {}", err);
//! ```

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

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
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Level for a raw value; anything above 5 is `Trace`.
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v.min(5))]
    }

    /// Level for a name or digit, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return (n <= 5).then(|| Self::from_u8(n));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.name().eq_ignore_ascii_case(s))
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Bracketed tag, padded to a common width.
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Low three bits hold the level, FLUSH_BIT the flush switch.
const LEVEL_MASK: u8 = 0b0000_0111;
const FLUSH_BIT: u8 = 0b1000_0000;

static SETTINGS: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static ENV_INIT: Once = Once::new();

/// Apply `SCGI_LOG_LEVEL` and `SCGI_FLUSH_EPRINT`. Runs at most once and
/// never after an explicit `set_log_level`/`set_flush_enabled`.
pub fn init() {
    ENV_INIT.call_once(|| {
        if let Some(level) = std::env::var("SCGI_LOG_LEVEL").ok().and_then(|v| LogLevel::parse(&v)) {
            store_level(level);
        }
        if crate::env::env_get_bool("SCGI_FLUSH_EPRINT", false) {
            SETTINGS.fetch_or(FLUSH_BIT, Ordering::Relaxed);
        }
    });
}

fn settings() -> u8 {
    init();
    SETTINGS.load(Ordering::Relaxed)
}

fn store_level(level: LogLevel) {
    let _ = SETTINGS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
        Some((s & !LEVEL_MASK) | level as u8)
    });
}

pub fn log_level() -> LogLevel {
    LogLevel::from_u8(settings() & LEVEL_MASK)
}

pub fn flush_enabled() -> bool {
    settings() & FLUSH_BIT != 0
}

/// Override the level. The environment is no longer consulted afterwards.
pub fn set_log_level(level: LogLevel) {
    ENV_INIT.call_once(|| {});
    store_level(level);
}

pub fn set_flush_enabled(enabled: bool) {
    ENV_INIT.call_once(|| {});
    if enabled {
        SETTINGS.fetch_or(FLUSH_BIT, Ordering::Relaxed);
    } else {
        SETTINGS.fetch_and(!FLUSH_BIT, Ordering::Relaxed);
    }
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

fn emit(tag: Option<LogLevel>, args: fmt::Arguments<'_>) {
    let mut err = std::io::stderr().lock();
    let _ = match tag {
        Some(level) => writeln!(err, "{} [{}] {}", level.prefix(), std::process::id(), args),
        None => writeln!(err, "{}", args),
    };
    if flush_enabled() {
        let _ = err.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: fmt::Arguments<'_>) {
    emit(None, args);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args);
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

/// Untagged line on stderr, printed at every level.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) };
}
