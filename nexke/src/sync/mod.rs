// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives.
//!
//! There is no thread-level blocking in this kernel core: every shared
//! structure is protected by a spin lock taken with interrupts masked at
//! an appropriate IPL, so a lock can never be re-entered on the same CPU.
//! There is deliberately no `Mutex`/`RwLock`/wait-queue here — those belong
//! to a scheduler, which lives above this layer.

mod spin;

pub use self::spin::{SpinLock, SpinLockGuard};
