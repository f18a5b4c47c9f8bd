// SPDX-License-Identifier: MPL-2.0

//! Memory management: the physical frame manager, slab allocator, kernel
//! virtual arena, page-table manager, VM objects, and resource-ID arena.

pub mod frame;
pub mod frame_allocator;
pub mod heap_allocator;
pub mod kv_arena;
pub mod object;
pub mod page_table;
pub mod resource;
pub mod slab;

/// A physical address or frame-aligned physical address, depending on
/// context. Kept as a bare integer rather than a newtype so arithmetic
/// against frame numbers and raw hardware registers reads naturally,
/// matching the rest of the corpus this crate is grounded on.
pub type Paddr = usize;

/// A kernel or user virtual address.
pub type Vaddr = usize;

/// Brings up the memory subsystem in dependency order: the frame
/// manager first (everything else draws pages from it), then the
/// page-table window cache's permanent backing, then the slab and KV
/// arena layers that ride on top of both.
///
/// # Safety
///
/// Must run exactly once, early in boot, after [`crate::boot`] has
/// handed off the physical memory map and before any other `mm` entry
/// point is called.
pub unsafe fn init(boot_info: &crate::boot::BootInfo) {
    // Safety: delegated to the caller; `boot_info` describes the usable
    // physical memory map handed off by the bootloader.
    unsafe { frame_allocator::init(boot_info) };
    crate::arch::x86_64::mmu::bootstrap_windows();
    slab::init();
    kv_arena::init(boot_info);
}
