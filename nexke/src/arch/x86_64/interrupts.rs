// SPDX-License-Identifier: MPL-2.0

//! Thin wrapper around the CPU's interrupt-enable flag.
//!
//! [`crate::trap::ipl`] is the only caller that should touch this: raising
//! IPL below `IPL_HIGH` reprograms the controller's priority threshold and
//! leaves interrupts enabled, while `IPL_HIGH` disables them outright.

/// Returns whether local interrupts are currently enabled on this CPU.
#[cfg(not(test))]
pub fn are_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

/// Enables local interrupts.
#[cfg(not(test))]
pub fn enable_local() {
    x86_64::instructions::interrupts::enable();
}

/// Disables local interrupts.
#[cfg(not(test))]
pub fn disable_local() {
    x86_64::instructions::interrupts::disable();
}

// `cli`/`sti` are privileged instructions: a host unit test runs in ring
// 3 and would fault executing them. `trap::ipl`'s tests exercise only the
// IPL bookkeeping, so these track the flag without touching the CPU.
#[cfg(test)]
mod test_stub {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn are_enabled() -> bool {
        ENABLED.load(Ordering::Relaxed)
    }

    pub fn enable_local() {
        ENABLED.store(true, Ordering::Relaxed);
    }

    pub fn disable_local() {
        ENABLED.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub use test_stub::{are_enabled, disable_local, enable_local};
