// SPDX-License-Identifier: MPL-2.0

//! Entry point called by `trapframe`'s assembly stubs on every trap:
//! classify the vector and hand it to [`super::irq::dispatch`].

use trapframe::TrapFrame;

use super::irq;

#[no_mangle]
extern "sysv64" fn trap_handler(f: &mut TrapFrame) {
    irq::dispatch(f.trap_num as u8, f);
}

/// Installs the trap entry stubs and brings up the vector table. Must
/// run once, on the boot CPU, before interrupts are unmasked.
pub(crate) fn init() {
    irq::init();
    // Safety: called once during boot, before any trap can fire.
    unsafe {
        trapframe::init();
    }
}
