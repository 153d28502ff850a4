//! Kernel logging.
//!
//! Every record lands in a fixed in-memory ring, so messages logged before
//! any console exists are kept, not lost; once boot installs a console
//! hook, records at or above the echo threshold are mirrored to it as they
//! arrive and the backlog stays readable through [`snapshot`] (the kernel's
//! message buffer). [`kprint!`]/[`kprintln!`] bypass the ring and stream
//! straight to the console for terminal output and the boot banner.
//!
//! The record path only ever try-locks the ring: logging from a context
//! that interrupted the logger drops the record instead of spinning on a
//! lock that cannot be released.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::sync::SpinLock;

/// Bytes retained in the message ring.
pub const LOG_RING_SIZE: usize = 4096;

/// Longest single record, including the level tag and newline; anything
/// longer is truncated at a character boundary.
pub const LOG_LINE_MAX: usize = 240;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// The system cannot continue.
    Fatal = 0,
    /// An operation failed.
    Error = 1,
    /// Something unexpected, probably survivable.
    Warn = 2,
    /// Normal progress reporting.
    Info = 3,
    /// Development diagnostics.
    Debug = 4,
}

impl LogLevel {
    /// One-character tag used as the record prefix.
    pub const fn tag(self) -> char {
        match self {
            Self::Fatal => 'F',
            Self::Error => 'E',
            Self::Warn => 'W',
            Self::Info => 'I',
            Self::Debug => 'D',
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Fatal,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// Console output hook: receives already formatted text.
pub type ConsoleFn = fn(&str);

struct LogState {
    ring: [u8; LOG_RING_SIZE],
    /// Total bytes ever recorded; the write position is `head % ring len`.
    head: usize,
    console: Option<ConsoleFn>,
}

impl LogState {
    const fn new() -> Self {
        Self {
            ring: [0; LOG_RING_SIZE],
            head: 0,
            console: None,
        }
    }

    fn record(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.ring[self.head % LOG_RING_SIZE] = byte;
            self.head += 1;
        }
    }
}

static LOG: SpinLock<LogState> = SpinLock::new(LogState::new());

/// Records at or above (numerically at or below) this level echo to the
/// console; everything still lands in the ring.
static ECHO_THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Installs the console hook.
///
/// May be called again when a better console comes up (early serial first,
/// the terminal later); the ring keeps whatever was logged in between.
pub fn set_console(console: ConsoleFn) {
    LOG.lock().console = Some(console);
}

/// Sets the least severe level that still echoes to the console.
pub fn set_echo_threshold(level: LogLevel) {
    ECHO_THRESHOLD.store(level as u8, Ordering::Relaxed);
}

/// The current echo threshold.
pub fn echo_threshold() -> LogLevel {
    LogLevel::from_u8(ECHO_THRESHOLD.load(Ordering::Relaxed))
}

/// Copies the newest ring contents into `out`, oldest byte first.
///
/// Returns the number of bytes written; at most the ring size, the amount
/// ever logged, or `out.len()`, whichever is smallest.
pub fn snapshot(out: &mut [u8]) -> usize {
    let state = LOG.lock();
    let avail = state.head.min(LOG_RING_SIZE);
    let take = avail.min(out.len());
    let start = state.head - take;
    for (i, slot) in out[..take].iter_mut().enumerate() {
        *slot = state.ring[(start + i) % LOG_RING_SIZE];
    }
    take
}

/// One formatted record, truncated at `LOG_LINE_MAX`.
struct LineBuf {
    buf: [u8; LOG_LINE_MAX],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_LINE_MAX],
            len: 0,
        }
    }

    fn push_char(&mut self, c: char) {
        let _ = self.write_str(c.encode_utf8(&mut [0u8; 4]));
    }

    fn as_str(&self) -> &str {
        // Only whole UTF-8 fragments are ever appended.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_LINE_MAX - self.len;
        let take = if s.len() <= room {
            s.len()
        } else {
            // Truncate on a character boundary.
            let mut cut = 0;
            for (at, _) in s.char_indices() {
                if at > room {
                    break;
                }
                cut = at;
            }
            cut
        };
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Streams to the console hook without touching the ring.
struct ConsoleWriter(ConsoleFn);

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

/// Implementation detail of [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut line = LineBuf::new();
    line.push_char('[');
    line.push_char(level.tag());
    let _ = line.write_str("] ");
    let _ = line.write_fmt(args);
    line.push_char('\n');

    // Reentrant records (logging from inside the logger's own critical
    // section) are dropped rather than deadlocking on the ring.
    let console = match LOG.try_lock() {
        Some(mut state) => {
            state.record(&line.buf[..line.len]);
            state.console
        }
        None => None,
    };
    if level as u8 <= ECHO_THRESHOLD.load(Ordering::Relaxed) {
        if let Some(console) = console {
            console(line.as_str());
        }
    }
}

/// Implementation detail of [`kprint!`]. Not public API.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    let console = match LOG.try_lock() {
        Some(state) => state.console,
        None => None,
    };
    if let Some(console) = console {
        let _ = ConsoleWriter(console).write_fmt(args);
    }
}

/// Writes raw text to the console, skipping the message ring.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => { $crate::log::_print(format_args!($($arg)*)) };
}

/// Writes raw text plus a newline to the console.
#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => { $crate::kprint!("{}\n", format_args!($($arg)*)) };
}

/// Records a message at an explicit level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Records a fatal message.
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Records an error message.
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Records a warning.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Records a progress message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Records a diagnostic message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    // The ring, threshold and console hook are process-wide; tests take
    // turns and reset what they touched.
    static GATE: Mutex<()> = Mutex::new(());

    static CAPTURE: SpinLock<String> = SpinLock::new(String::new());

    fn capture_console(s: &str) {
        CAPTURE.lock().push_str(s);
    }

    fn drop_console(_s: &str) {}

    fn ring_text() -> String {
        let mut buf = [0u8; LOG_RING_SIZE];
        let n = snapshot(&mut buf);
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn preconsole_records_survive_in_the_ring() {
        let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
        set_console(drop_console);
        crate::kinfo!("mounted root from {}", "ram0");
        assert!(ring_text().contains("[I] mounted root from ram0\n"));
    }

    #[test]
    fn echo_respects_threshold_but_ring_does_not() {
        let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
        CAPTURE.lock().clear();
        set_console(capture_console);
        set_echo_threshold(LogLevel::Warn);

        crate::kinfo!("quiet {}", 1);
        crate::kwarn!("loud {}", 2);

        let echoed = CAPTURE.lock().clone();
        assert!(!echoed.contains("quiet"));
        assert!(echoed.contains("[W] loud 2\n"));
        let ring = ring_text();
        assert!(ring.contains("quiet 1"));
        assert!(ring.contains("loud 2"));

        set_echo_threshold(LogLevel::Info);
        set_console(drop_console);
    }

    #[test]
    fn oversized_records_truncate_on_char_boundary() {
        let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
        set_console(drop_console);
        let wide = "é".repeat(LOG_LINE_MAX);
        crate::kerr!("{}", wide);
        let ring = ring_text();
        // The record went in, bounded, and the snapshot is still valid text.
        assert!(ring.contains("[E] é"));
        assert!(!ring.contains('\u{fffd}'));
    }

    #[test]
    fn ring_wraps_and_keeps_the_newest_records() {
        let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
        set_console(drop_console);
        for i in 0..200 {
            crate::kdebug!("filler record number {:04}", i);
        }
        let ring = ring_text();
        assert!(ring.len() <= LOG_RING_SIZE);
        assert!(ring.contains("filler record number 0199"));
        assert!(!ring.contains("filler record number 0000"));
    }

    #[test]
    fn raw_print_streams_past_the_ring() {
        let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
        CAPTURE.lock().clear();
        set_console(capture_console);
        let long = "x".repeat(LOG_LINE_MAX * 3);
        crate::kprintln!("banner {}", long);
        let echoed = CAPTURE.lock().clone();
        assert!(echoed.contains(&long));
        assert!(echoed.ends_with('\n'));
        assert!(!ring_text().contains("banner"));
        set_console(drop_console);
    }
}
