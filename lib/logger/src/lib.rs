#![cfg_attr(not(test), no_std)]

use crate_interface::call_interface;
use log::LevelFilter;

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }
    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        call_interface!(LogSink::write_record(record));
    }
    fn flush(&self) {}
}

/// Output seam: the embedder decides where records go (console, serial,
/// test capture) by implementing this with `#[crate_interface::impl_interface]`.
#[crate_interface::def_interface]
pub trait LogSink: Send + Sync {
    fn write_record(record: &log::Record);
}

/// Install the logger. The level is fixed at compile time from the `LOG`
/// environment variable.
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    log::set_logger(&LOGGER).ok();
    log::set_max_level(match option_env!("LOG") {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Off,
    });
}
