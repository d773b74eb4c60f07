//! Severity logger with a pluggable byte sink.
//!
//! The sink is the serial console on bare metal; before one is installed (or
//! on the host) messages are dropped, so every code path may log
//! unconditionally. The console lock serializes whole lines, never single
//! bytes.

use core::fmt::{self, Write};
use spin::{Mutex, Once};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "dbg",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "err",
        }
    }
}

pub type Sink = fn(&str);

pub struct Logger {
    /// Console lock: one writer at a time, whole lines.
    sink: Mutex<Sink>,
    min_level: Level,
}

struct SinkWriter(Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

impl Logger {
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if level < self.min_level {
            return;
        }
        let sink = self.sink.lock();
        let mut w = SinkWriter(*sink);
        let _ = write!(w, "[{}] ", level.tag());
        let _ = w.write_fmt(args);
        let _ = w.write_str("\n");
    }
}

static LOGGER: Once<Logger> = Once::new();

/// Install the global logger. First call wins.
pub fn init(sink: Sink, min_level: Level) {
    LOGGER.call_once(|| Logger {
        sink: Mutex::new(sink),
        min_level,
    });
}

pub fn try_get_logger() -> Option<&'static Logger> {
    LOGGER.get()
}
