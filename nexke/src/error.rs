// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the recoverable APIs of this crate.
///
/// Invariant violations (double free, corrupted slab magic, a user PTE
/// installed beneath a kernel PTE, an unhandled trap vector) are not
/// represented here: those are fatal and the offending call panics instead.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A request could not be satisfied because some resource (frames,
    /// virtual address space, slab objects, resource ids) was exhausted.
    NoMemory,
    /// An argument was out of range, misaligned, or otherwise malformed.
    InvalidArgs,
    /// A virtual address has no mapping, or the mapping that exists does
    /// not permit the access that was attempted.
    AccessDenied,
    /// A page fault could not be resolved (no space entry covers the
    /// faulting address, or the page found is a guard page).
    PageFault,
    /// A fixed-size resource pool (IRQ vectors, resource ids, PT cache
    /// entries) has nothing left to hand out.
    NotEnoughResources,
    /// An address or size computation overflowed.
    Overflow,
}
