//! Caller-supplied callbacks.
//!
//! The engine emits leveled text messages to a [`LogSink`] and polls an
//! [`InterruptCheck`] predicate during every blocking wait. Both are
//! threaded explicitly into the engine constructor; there is no
//! process-global hook state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Log severity, ordered from most to least severe.
///
/// Numeric values match the reference client's level table
/// (1 = fatal .. 8 = trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable engine failure.
    Fatal = 1,
    /// Operation failure surfaced to the caller.
    Error = 3,
    /// Recoverable anomaly (retransmission, stale peer, ...).
    Warn = 4,
    /// Session lifecycle events.
    Info = 6,
    /// Per-operation detail.
    Debug = 7,
    /// Per-datagram detail.
    Trace = 8,
}

impl LogLevel {
    /// Map a raw level number (reference client convention) to a level.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 | 1 => Self::Fatal,
            2 | 3 => Self::Error,
            4 => Self::Warn,
            5 | 6 => Self::Info,
            7 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// Short uppercase label, as printed by the reference client.
    pub fn label(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Destination for engine log messages.
pub trait LogSink: Send + Sync {
    /// Deliver one leveled message.
    fn log(&self, level: LogLevel, message: &str);
}

/// Default sink forwarding to the `tracing` ecosystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Fatal | LogLevel::Error => tracing::error!(target: "rtmfp", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "rtmfp", "{message}"),
            LogLevel::Info => tracing::info!(target: "rtmfp", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "rtmfp", "{message}"),
            LogLevel::Trace => tracing::trace!(target: "rtmfp", "{message}"),
        }
    }
}

/// Cancellation predicate polled during all blocking waits.
///
/// Returning `true` aborts the pending operation with
/// [`RtmfpError::Interrupted`](crate::core::RtmfpError::Interrupted);
/// the session is left in a well-defined, closable state.
pub trait InterruptCheck: Send + Sync {
    /// `true` when the caller wants the current wait aborted.
    fn is_interrupted(&self) -> bool;
}

impl<F> InterruptCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_interrupted(&self) -> bool {
        self()
    }
}

/// Interrupt flag backed by an atomic, handy for tests and simple callers.
#[derive(Debug, Default, Clone)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag; every pending wait observes it within one poll period.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl InterruptCheck for InterruptFlag {
    fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_matches_reference_table() {
        assert_eq!(LogLevel::from_raw(1), LogLevel::Fatal);
        assert_eq!(LogLevel::from_raw(2), LogLevel::Error);
        assert_eq!(LogLevel::from_raw(3), LogLevel::Error);
        assert_eq!(LogLevel::from_raw(4), LogLevel::Warn);
        assert_eq!(LogLevel::from_raw(5), LogLevel::Info);
        assert_eq!(LogLevel::from_raw(6), LogLevel::Info);
        assert_eq!(LogLevel::from_raw(7), LogLevel::Debug);
        assert_eq!(LogLevel::from_raw(8), LogLevel::Trace);
    }

    #[test]
    fn interrupt_flag_roundtrip() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_interrupted());
        flag.interrupt();
        assert!(flag.is_interrupted());
        flag.reset();
        assert!(!flag.is_interrupted());
    }

    #[test]
    fn closure_is_an_interrupt_check() {
        let check = || true;
        assert!(InterruptCheck::is_interrupted(&check));
    }
}
