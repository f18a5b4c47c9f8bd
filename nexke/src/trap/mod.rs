// SPDX-License-Identifier: MPL-2.0

//! Trap dispatch and interrupt priority levels.
//!
//! Concurrency in this kernel core is IPL-based rather than
//! preempt-count-based: there is no `disable_local`/guard apparatus
//! here, only [`ipl::raise_ipl`]/[`ipl::lower_ipl`], which
//! [`crate::sync::SpinLock`] builds on directly.

mod handler;
mod irq;
pub mod ipl;

pub use trapframe::TrapFrame;

pub use self::irq::{
    in_interrupt_context, install_exception, install_hardware_interrupt, install_service,
    interrupt_count, remap_interrupt, spurious_count, HwFlags, HwInterrupt, InterruptMode,
    Polarity, HARDWARE_BASE,
};

pub(crate) fn init() {
    handler::init();
}
