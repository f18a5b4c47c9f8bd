// SPDX-License-Identifier: MPL-2.0

//! Interrupt priority levels.
//!
//! An IPL masks every interrupt at or below itself on the current CPU.
//! `raise_ipl`/`lower_ipl` form a strictly nested pair: you may only raise
//! to a level above the current one, and lowering always restores exactly
//! the level that was current before the matching raise.

#[cfg(not(test))]
use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::x86_64::interrupts;
use crate::arch::x86_64::pic as controller;

/// `IPL_LOW` is the level normal kernel code runs at: no interrupt is
/// masked. `IPL_HIGH` masks everything, including the timer tick; it is
/// the level the dispatch loop runs hardware handlers at and the level
/// required to mutate any resource shared with interrupt context.
pub type Ipl = u8;

pub const IPL_LOW: Ipl = 0;
pub const IPL_TIMER: Ipl = 0x10;
pub const IPL_HIGH: Ipl = 0xff;

// On the real target this is genuinely per-CPU state living in one
// global (there is exactly one hart of execution per `CURRENT_IPL`).
// A host unit test binary has no such guarantee: cargo runs tests on a
// thread pool, and every `SpinLock::lock()` across the whole crate's
// test suite raises/lowers this level, so a single global would let
// unrelated tests on other threads stomp each other's IPL and trip the
// nesting asserts below. Give each test thread its own cell instead;
// on the real kernel each CPU already gets the equivalent by virtue of
// being a separate core.
#[cfg(not(test))]
static CURRENT_IPL: AtomicU8 = AtomicU8::new(IPL_LOW);

#[cfg(not(test))]
fn load_ipl() -> Ipl {
    CURRENT_IPL.load(Ordering::Relaxed)
}

#[cfg(not(test))]
fn store_ipl(new: Ipl) {
    CURRENT_IPL.store(new, Ordering::Relaxed);
}

#[cfg(test)]
std::thread_local! {
    static CURRENT_IPL: core::cell::Cell<Ipl> = const { core::cell::Cell::new(IPL_LOW) };
}

#[cfg(test)]
fn load_ipl() -> Ipl {
    CURRENT_IPL.with(|c| c.get())
}

#[cfg(test)]
fn store_ipl(new: Ipl) {
    CURRENT_IPL.with(|c| c.set(new));
}

/// Returns the current CPU's IPL.
pub fn current_ipl() -> Ipl {
    load_ipl()
}

/// Raises the current CPU's IPL to `new`, returning the previous level.
///
/// `new` must be strictly greater than the current IPL. Below `IPL_HIGH`
/// this also reprograms the interrupt controller's priority threshold and
/// leaves local interrupts enabled; at or above `IPL_HIGH` local
/// interrupts are disabled outright, since there is no controller
/// priority left to delegate to.
pub fn raise_ipl(new: Ipl) -> Ipl {
    let old = load_ipl();
    assert!(new > old, "raise_ipl: {new:#x} does not exceed current {old:#x}");
    store_ipl(new);
    if new >= IPL_HIGH {
        interrupts::disable_local();
    } else {
        controller::set_priority_threshold(new);
        interrupts::enable_local();
    }
    old
}

/// Lowers the current CPU's IPL back to `old`, the value a matching
/// `raise_ipl` returned.
pub fn lower_ipl(old: Ipl) {
    let current = load_ipl();
    assert!(old <= current, "lower_ipl: {old:#x} exceeds current {current:#x}");
    store_ipl(old);
    if old >= IPL_HIGH {
        interrupts::disable_local();
    } else {
        controller::set_priority_threshold(old);
        interrupts::enable_local();
    }
}

/// RAII guard returned by [`raise_ipl_guard`]; lowers the IPL back on drop.
#[must_use]
pub struct IplGuard {
    old: Ipl,
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        lower_ipl(self.old);
    }
}

/// Raises the IPL to `new` and returns a guard that lowers it back to the
/// prior level when dropped. This is the primitive [`crate::sync::SpinLock`]
/// builds on.
pub fn raise_ipl_guard(new: Ipl) -> IplGuard {
    IplGuard { old: raise_ipl(new) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nested_raise_lower_restores_level() {
        let a = raise_ipl(0x20);
        assert_eq!(a, IPL_LOW);
        {
            let b = raise_ipl(0x40);
            assert_eq!(b, 0x20);
            lower_ipl(b);
        }
        assert_eq!(current_ipl(), 0x20);
        lower_ipl(a);
        assert_eq!(current_ipl(), IPL_LOW);
    }
}
