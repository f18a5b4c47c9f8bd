// SPDX-License-Identifier: MPL-2.0

//! A minimal COM1 16550 UART writer, backing [`crate::logger`]. This
//! crate has no console driver of its own, and the logging ambient
//! stack needs somewhere to put bytes.

use core::fmt::{self, Write};

use super::io_port::{IoPort, ReadWriteAccess, WriteOnlyAccess};

const COM1: u16 = 0x3f8;

const DATA: IoPort<u8, ReadWriteAccess> = unsafe { IoPort::new(COM1) };
const INT_ENABLE: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(COM1 + 1) };
const FIFO_CTRL: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(COM1 + 2) };
const LINE_CTRL: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(COM1 + 3) };
const MODEM_CTRL: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(COM1 + 4) };
const LINE_STATUS: IoPort<u8, ReadWriteAccess> = unsafe { IoPort::new(COM1 + 5) };

/// Programs COM1 for 38400 8N1 with FIFOs enabled. Safe to call more than
/// once.
pub fn init() {
    INT_ENABLE.write(0x00);
    LINE_CTRL.write(0x80); // enable divisor-latch access
    DATA.write(0x03); // divisor low byte: 38400 baud
    INT_ENABLE.write(0x00); // divisor high byte
    LINE_CTRL.write(0x03); // 8N1, divisor latch off
    FIFO_CTRL.write(0xc7);
    MODEM_CTRL.write(0x0b);
}

fn transmit_empty() -> bool {
    LINE_STATUS.read() & 0x20 != 0
}

fn write_byte(byte: u8) {
    while !transmit_empty() {
        core::hint::spin_loop();
    }
    DATA.write(byte);
}

pub struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            write_byte(byte);
        }
        Ok(())
    }
}
