// SPDX-License-Identifier: MPL-2.0

//! PIT-based hardware clock.
//!
//! The legacy 8259 PIC this kernel core's
//! [`crate::arch::x86_64::pic`] models cannot be reprogrammed to a new
//! one-shot deadline the way a local APIC timer can, so this clock runs
//! at a fixed [`crate::config::TIMER_FREQ`] and is registered with the
//! scheduler as a `SOFT`-typed hardware timer: the outer loop also
//! tick-polls the clock, and every tick calls
//! [`crate::time::timer::on_tick`], which itself decides whether
//! anything is actually due.

use core::sync::atomic::{AtomicU64, Ordering};

use trapframe::TrapFrame;

use super::io_port::{IoPort, WriteOnlyAccess};
use crate::config::TIMER_FREQ;
use crate::trap::{self, ipl, HwFlags, InterruptMode, Polarity};

const TIMER_RATE: u32 = 1_193_182;
const TIMER_PERIOD: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(0x40) };
const TIMER_MOD: IoPort<u8, WriteOnlyAccess> = unsafe { IoPort::new(0x43) };
const SQUARE_WAVE_MODE: u8 = 0x34;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Current tick count since boot, at [`TIMER_FREQ`] ticks/second.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

fn on_interrupt(_frame: &TrapFrame) -> bool {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::time::timer::on_tick();
    true
}

/// Programs the PIT for a fixed-rate square wave at [`TIMER_FREQ`] and
/// installs its GSI0 hardware interrupt. Must run once, after
/// [`trap::init`].
pub fn init() {
    let cycle = TIMER_RATE / TIMER_FREQ as u32;
    TIMER_MOD.write(SQUARE_WAVE_MODE);
    TIMER_PERIOD.write((cycle & 0xff) as u8);
    TIMER_PERIOD.write((cycle >> 8) as u8);

    trap::install_hardware_interrupt(
        0,
        InterruptMode::Edge,
        Polarity::ActiveHigh,
        ipl::IPL_TIMER,
        HwFlags::INTERNAL,
        alloc::boxed::Box::new(on_interrupt),
    )
    .expect("failed to install the system timer's GSI0 interrupt");
}
