//! Console logger.
//!
//! A [`log`] backend that writes one line per record to the standard error
//! through the signal-safe console of [`abyss`], so the runtime can log from
//! the timer interrupt handler.
use abyss::kprint::{Stream, _print_to};
use core::sync::atomic::Ordering;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        !abyss::QUITE.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            _print_to(
                Stream::Stderr,
                format_args!("[{:<5}] {}\n", record.level(), record.args()),
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the console logger with `level` as the maximum level.
///
/// # Returns
/// An error if a logger was installed before.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Silences the console logger when `quiet` is set.
pub fn set_quiet(quiet: bool) {
    abyss::QUITE.store(quiet, Ordering::Relaxed);
}
