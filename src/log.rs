use std::env;
use std::fmt;
use std::io::{self, Write};

/// Minimum level that gets printed is chosen once, from the `SHAKEDOWN_LOG`
/// environment variable (`error`, `warn`, `info`, `debug`). Defaults to warn.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogError = 0,
    LogWarn = 1,
    LogInfo = 2,
    LogDebug = 3,
}

lazy_static! {
    static ref LOG_LEVEL: LogLevel = init_log_level();
    static ref LOG_COLOUR: bool = init_log_colour();
}

fn init_log_level() -> LogLevel {
    match env::var("SHAKEDOWN_LOG").as_ref().map(|s| s.as_str()) {
        Ok("error") => LogLevel::LogError,
        Ok("warn") => LogLevel::LogWarn,
        Ok("info") => LogLevel::LogInfo,
        Ok("debug") => LogLevel::LogDebug,
        _ => LogLevel::LogWarn,
    }
}

fn init_log_colour() -> bool {
    // Colour goes to a human, not to a pipe the outer driver parses.
    unsafe { libc::isatty(libc::STDERR_FILENO) == 1 }
}

fn colour_code(level: LogLevel) -> &'static str {
    match level {
        LogLevel::LogError => "\x1b[1;31m",
        LogLevel::LogWarn => "\x1b[1;33m",
        LogLevel::LogInfo => "\x1b[36m",
        LogLevel::LogDebug => "\x1b[2m",
    }
}

pub fn write_log(level: LogLevel, module: &str, args: fmt::Arguments) {
    if level > *LOG_LEVEL {
        return;
    }
    let stderr = io::stderr();
    let mut f = stderr.lock();
    let result = if *LOG_COLOUR {
        writeln!(f, "{}[{}] {}\x1b[0m", colour_code(level), module, args)
    } else {
        writeln!(f, "[{}] {}", module, args)
    };
    // A full stderr is not a reason to take down the exploration.
    result.unwrap_or(())
}

pub fn write_fatal(module: &str, args: fmt::Arguments) {
    let stderr = io::stderr();
    let mut f = stderr.lock();
    let _ = writeln!(f, "\x1b[1;31m[{}] FATAL: {}\x1b[0m", module, args);
    let _ = writeln!(f, "{:?}", backtrace::Backtrace::new());
}

macro_rules! log {
    ($level:expr, $($args:tt)+) => {
        crate::log::write_log($level, module_path!(), format_args!($($args)+))
    };
}

/// Invariant violations in the checker itself are bugs in the checker; dump a
/// stack trace and abort the process.
macro_rules! fatal {
    ($($args:tt)+) => {{
        crate::log::write_fatal(module_path!(), format_args!($($args)+));
        panic!($($args)+);
    }};
}
