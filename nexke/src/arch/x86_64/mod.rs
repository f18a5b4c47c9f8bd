// SPDX-License-Identifier: MPL-2.0

pub mod interrupts;
pub mod io_port;
pub mod mmu;
pub mod pic;
pub mod serial;
pub mod timer;

use trapframe::TrapFrame;

/// Halts the CPU until the next interrupt. Used by the idle path and by
/// the poll loop while spin-waiting on the clock.
pub fn halt() {
    x86_64::instructions::hlt();
}

bitflags::bitflags! {
    /// Raw bits of the error code the CPU pushes for a #PF exception.
    struct PageFaultErrorCode: u32 {
        const PRESENT     = 1 << 0;
        const WRITE       = 1 << 1;
        const USER        = 1 << 2;
        const INSTRUCTION = 1 << 4;
    }
}

const PAGE_FAULT_VECTOR: u8 = 14;

fn page_fault_handler(frame: &mut TrapFrame) -> bool {
    let vaddr = x86_64::registers::control::Cr2::read().as_u64() as usize;
    let code = PageFaultErrorCode::from_bits_truncate(frame.error_code as u32);

    let mut prot = crate::mm::object::FaultProt::empty();
    if !code.contains(PageFaultErrorCode::USER) {
        prot |= crate::mm::object::FaultProt::KERNEL;
    }
    if code.contains(PageFaultErrorCode::WRITE) {
        prot |= crate::mm::object::FaultProt::WRITE;
    }
    if code.contains(PageFaultErrorCode::PRESENT) {
        prot |= crate::mm::object::FaultProt::PRESENT;
    }

    crate::mm::object::page_fault(vaddr, prot).is_ok()
}

/// Registers the #PF exception handler with the trap vector table. Must
/// run once, after [`crate::trap::init`].
pub fn init_page_fault_handler() {
    crate::trap::install_exception(PAGE_FAULT_VECTOR, page_fault_handler);
}
