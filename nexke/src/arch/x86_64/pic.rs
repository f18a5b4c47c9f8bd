// SPDX-License-Identifier: MPL-2.0

//! Legacy 8259 programmable interrupt controller.
//!
//! This implements `begin_interrupt`/`end_interrupt`/spurious detection,
//! plus the IPL-to-"task priority equivalent" programming `raise_ipl`
//! does below `IPL_HIGH`. The PIC has no software-settable priority
//! register the way a local APIC's TPR does, so the priority threshold
//! is emulated by masking every line whose configured IPL is at or
//! below the requested one; remapping a chain to a different vector
//! likewise only adjusts the recorded IPL, since a
//! GSI's vector is fixed by the master/slave wiring on this controller.
//! A platform with an I/O APIC would not need either compromise; see
//! DESIGN.md.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering::Relaxed};

use super::io_port::{IoPort, ReadWriteAccess, WriteOnlyAccess};
use crate::trap::ipl::Ipl;

const MASTER_CMD: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(0x20) };
const MASTER_DATA: IoPort<u8, ReadWriteAccess> = unsafe { IoPort::new(0x21) };
const SLAVE_CMD: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(0xA0) };
const SLAVE_DATA: IoPort<u8, ReadWriteAccess> = unsafe { IoPort::new(0xA1) };

const OCW3_READ_ISR: u8 = 0x0b;

/// Vector of GSI 0 (IRQ0). GSIs 0..8 live on the master, 8..16 on the slave.
pub const VECTOR_BASE: u8 = 0x20;

static INSTALLED: [AtomicBool; 16] = [const { AtomicBool::new(false) }; 16];
static LINE_IPL: [AtomicU8; 16] = [const { AtomicU8::new(0) }; 16];
static THRESHOLD: AtomicU8 = AtomicU8::new(0);

/// Remaps the PIC's vector base and masks every line.
pub fn init() {
    MASTER_CMD.write(0x11);
    SLAVE_CMD.write(0x11);
    MASTER_DATA.write(VECTOR_BASE);
    SLAVE_DATA.write(VECTOR_BASE + 8);
    MASTER_DATA.write(4); // slave attached at IRQ2
    SLAVE_DATA.write(2);
    MASTER_DATA.write(1); // 8086 mode
    SLAVE_DATA.write(1);
    MASTER_DATA.write(0xff);
    SLAVE_DATA.write(0xff);
}

/// Records the IPL a hardware line dispatches at and marks it installed,
/// then reprograms the mask registers for the current threshold.
pub fn set_line_ipl(gsi: u8, ipl: Ipl) {
    assert!(gsi < 16);
    LINE_IPL[gsi as usize].store(ipl, Relaxed);
    INSTALLED[gsi as usize].store(true, Relaxed);
    apply_mask();
}

fn apply_mask() {
    let threshold = THRESHOLD.load(Relaxed);
    let mut master = 0u8;
    let mut slave = 0u8;
    for gsi in 0..16u8 {
        let masked =
            !INSTALLED[gsi as usize].load(Relaxed) || LINE_IPL[gsi as usize].load(Relaxed) <= threshold;
        if masked {
            if gsi < 8 {
                master |= 1 << gsi;
            } else {
                slave |= 1 << (gsi - 8);
            }
        }
    }
    MASTER_DATA.write(master);
    SLAVE_DATA.write(slave);
}

/// Reprograms the mask for the given IPL threshold (the controller's
/// task-priority equivalent, set by `raise_ipl`).
///
/// Stubbed under host unit tests: `apply_mask` issues real `out`
/// instructions to ports that do not exist (and are privileged) outside
/// ring 0, which `trap::ipl`'s tests would otherwise hit on every raise.
#[cfg(not(test))]
pub(crate) fn set_priority_threshold(ipl: Ipl) {
    THRESHOLD.store(ipl, Relaxed);
    apply_mask();
}

#[cfg(test)]
pub(crate) fn set_priority_threshold(ipl: Ipl) {
    THRESHOLD.store(ipl, Relaxed);
}

fn read_isr(cmd_port: u16) -> u8 {
    // Safety: `cmd_port` is one of the two PIC command ports; writing OCW3
    // selects the ISR register for the following read on the same port.
    unsafe {
        x86_64::instructions::port::PortWriteOnly::<u8>::new(cmd_port).write(OCW3_READ_ISR);
        x86_64::instructions::port::PortReadOnly::<u8>::new(cmd_port).read()
    }
}

/// Begins servicing an interrupt on `vector`. Returns `false` for a
/// spurious IRQ7/IRQ15 (the controller asserted the line but the ISR bit
/// never latched); the caller must not send EOI for the master in that
/// case.
pub fn begin_interrupt(vector: u8) -> bool {
    let gsi = vector.wrapping_sub(VECTOR_BASE);
    if gsi == 7 && read_isr(0x20) & 0x80 == 0 {
        return false;
    }
    if gsi == 15 && read_isr(0xA0) & 0x80 == 0 {
        // The slave line was spurious, but the master still thinks it
        // dispatched IRQ2 (the cascade line) and needs its own EOI.
        MASTER_CMD.write(0x20);
        return false;
    }
    true
}

/// Sends end-of-interrupt for `vector`.
pub fn end_interrupt(vector: u8) {
    let gsi = vector.wrapping_sub(VECTOR_BASE);
    if gsi >= 8 {
        SLAVE_CMD.write(0x20);
    }
    MASTER_CMD.write(0x20);
}

/// Moves a line's recorded IPL without touching its vector (see module
/// docs: this controller cannot remap a GSI to a different vector).
pub fn remap_ipl(gsi: u8, new_ipl: Ipl) {
    LINE_IPL[gsi as usize].store(new_ipl, Relaxed);
    apply_mask();
}
