//! Kernel logging.
//!
//! Subsystems report through the [`klog!`] macro (or the [`kinfo!`]
//! shorthand). A boot-time sink registered with [`set_log_fn`] carries each
//! message to whatever console exists; with no sink registered the message
//! is dropped. Never log while holding a lock the sink may also take.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Message severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// A failure the kernel may or may not survive.
    Error,
    /// Suspicious but survivable.
    Warn,
    /// Boot progress and subsystem summaries.
    Info,
    /// Chatty diagnostics.
    Debug,
}

/// A registered log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn discard(_: LogLevel, _: fmt::Arguments<'_>) {}

static SINK: AtomicPtr<()> = AtomicPtr::new(discard as *mut ());

/// Installs the log sink.
///
/// Safe to call again when a better console comes up; messages logged
/// before the first call are dropped.
///
/// # Safety
///
/// `sink` must be callable from every context the kernel logs in.
pub unsafe fn set_log_fn(sink: LogFn) {
    SINK.store(sink as *mut (), Ordering::Release);
}

/// Dispatches to the registered sink. Implementation detail of [`klog!`].
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    let sink = SINK.load(Ordering::Acquire);
    // SAFETY: SINK only ever holds `discard` or a pointer stored through
    // `set_log_fn`, both of which are valid `LogFn`s.
    let sink: LogFn = unsafe { core::mem::transmute(sink) };
    sink(level, args);
}

/// Logs at an explicit level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs at info level.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static INFO_SEEN: AtomicUsize = AtomicUsize::new(0);

    fn tally(level: LogLevel, _args: fmt::Arguments<'_>) {
        if level == LogLevel::Info {
            INFO_SEEN.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unregistered_sink_drops_messages() {
        // Must simply vanish, not panic.
        klog!(LogLevel::Debug, "no console yet: {}", 7);
    }

    #[test]
    fn sink_sees_level_and_message() {
        // SAFETY: tally is callable anywhere.
        unsafe { set_log_fn(tally) };
        let seen = INFO_SEEN.load(Ordering::SeqCst);
        kinfo!("pmm: {} pages", 4096);
        assert!(INFO_SEEN.load(Ordering::SeqCst) > seen);
    }

    #[test]
    fn levels_order_most_severe_first() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
    }
}
