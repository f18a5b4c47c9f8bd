// SPDX-License-Identifier: MPL-2.0

//! Logging support: a `log::Log` implementation backed by the serial
//! console.

use core::fmt::Write;

use log::{Level, Metadata, Record};

use crate::arch::x86_64::serial::SerialWriter;
use crate::config::DEFAULT_LOG_LEVEL;
use crate::sync::SpinLock;

struct Logger;

static LOGGER: Logger = Logger;
static WRITER: SpinLock<SerialWriter> = SpinLock::new(SerialWriter);

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= DEFAULT_LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(WRITER.lock(), "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Brings up the serial console and registers it with the `log` crate.
/// Must run once, as early in boot as possible so later init steps can
/// log.
pub fn init() {
    crate::arch::x86_64::serial::init();
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(DEFAULT_LOG_LEVEL.to_level_filter()))
        .expect("logger already initialized");
}
