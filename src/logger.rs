//! Stderr logger for the `log` facade.
//!
//! Records are formatted into a fixed stack buffer and emitted with a single
//! raw `write(2)`. No allocation and no locks, so the fault handler can log
//! while the target program owns the heap and the thread pointer.

use std::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::rt;

const MESSAGE_CAPACITY: usize = 512;

pub const LOG_ENV: &str = "ELFPAGER_LOG";

struct MessageBuffer {
    data: [u8; MESSAGE_CAPACITY],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; MESSAGE_CAPACITY],
            len: 0,
        }
    }

    /// The formatted record, newline-terminated even when truncated.
    fn finish(&mut self) -> &[u8] {
        if self.len == MESSAGE_CAPACITY {
            self.data[MESSAGE_CAPACITY - 1] = b'\n';
        }
        &self.data[..self.len]
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = MESSAGE_CAPACITY - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut buf = MessageBuffer::new();
        let _ = writeln!(buf, "[elfpager] {:>5} {}", record.level(), record.args());
        rt::write_stderr(buf.finish());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs the logger. Calling it again only changes the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Resolves the effective level: explicit flag, then `ELFPAGER_LOG`, then
/// the `-v` count on top of `warn`.
pub fn resolve_level(explicit: Option<LevelFilter>, env: Option<&str>, verbose: u8) -> LevelFilter {
    if let Some(level) = explicit {
        return level;
    }
    if let Some(level) = env.and_then(|v| v.trim().parse::<LevelFilter>().ok()) {
        return level;
    }
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
