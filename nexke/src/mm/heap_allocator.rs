// SPDX-License-Identifier: MPL-2.0

//! The kernel's `#[global_allocator]`.
//!
//! This backs ordinary `alloc::{Vec, Box, Arc}` usage throughout the
//! crate and is deliberately separate from [`crate::mm::slab`]: the slab
//! layer is the size-class `malloc`/`free` API and draws its own
//! pages straight from the frame manager, while this allocator only
//! needs to serve Rust's own collection types.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use align_ext::AlignExt;
use buddy_system_allocator::Heap;
use log::debug;

use crate::config::{KERNEL_HEAP_SIZE, PAGE_SIZE};
use crate::mm::frame_allocator;
use crate::prelude::*;
use crate::sync::SpinLock;

// Not claimed under host unit tests: the test harness brings its own
// (std) allocator, and this one would otherwise serve every allocation
// in the test binary before `init` ever ran.
#[cfg(not(test))]
#[global_allocator]
static HEAP_ALLOCATOR: LockedHeapWithRescue<32> = LockedHeapWithRescue::new(rescue);

#[cfg(not(test))]
#[alloc_error_handler]
fn handle_alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("heap allocation error, layout = {:?}", layout);
}

#[cfg(not(test))]
static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// Initializes the heap from the static bootstrap region. Must run once,
/// before the first `alloc`, and after the frame manager has taken
/// ownership of physical memory (the [`rescue`] path later hands this
/// heap frames from that same manager).
#[cfg(not(test))]
pub fn init() {
    // Safety: `HEAP_SPACE` is a static region, valid for the program's
    // whole lifetime, and `init` runs exactly once before first use.
    unsafe {
        HEAP_ALLOCATOR.init(core::ptr::addr_of!(HEAP_SPACE) as *const u8, KERNEL_HEAP_SIZE);
    }
}

#[cfg(test)]
pub fn init() {}

struct LockedHeapWithRescue<const ORDER: usize> {
    heap: SpinLock<Heap<ORDER>>,
    rescue: fn(&Self, &Layout) -> Result<()>,
}

impl<const ORDER: usize> LockedHeapWithRescue<ORDER> {
    const fn new(rescue: fn(&Self, &Layout) -> Result<()>) -> Self {
        Self {
            heap: SpinLock::new(Heap::<ORDER>::new()),
            rescue,
        }
    }

    /// # Safety
    ///
    /// `[start, start + size)` must be a valid, exclusively owned memory
    /// region.
    unsafe fn init(&self, start: *const u8, size: usize) {
        self.heap.lock().init(start as usize, size);
    }

    /// # Safety
    ///
    /// `[start, start + size)` must be a valid, exclusively owned memory
    /// region.
    unsafe fn add_to_heap(&self, start: usize, size: usize) {
        self.heap.lock().add_to_heap(start, start + size)
    }
}

unsafe impl<const ORDER: usize> GlobalAlloc for LockedHeapWithRescue<ORDER> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Ok(allocation) = self.heap.lock().alloc(layout) {
            return allocation.as_ptr();
        }

        // Drop the lock before calling the rescue path, which takes it
        // again once more memory has been added.
        if (self.rescue)(self, &layout).is_err() {
            return core::ptr::null_mut();
        }

        self.heap
            .lock()
            .alloc(layout)
            .map_or(core::ptr::null_mut(), |allocation| allocation.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        debug_assert!(!ptr.is_null());
        // Safety: `ptr` was handed out by a prior `alloc` on this heap.
        unsafe {
            self.heap
                .lock()
                .dealloc(NonNull::new_unchecked(ptr), layout)
        }
    }
}

/// Grows the heap by pulling fresh frames from the frame manager when
/// the static bootstrap region runs out.
fn rescue<const ORDER: usize>(heap: &LockedHeapWithRescue<ORDER>, layout: &Layout) -> Result<()> {
    const MIN_GROWTH: usize = 0x400_000 / PAGE_SIZE; // 4 MiB, in pages

    debug!("growing kernel heap for layout {:?}", layout);
    let align = PAGE_SIZE.max(layout.align());
    debug_assert!(align % PAGE_SIZE == 0);
    let wanted = layout.size().align_up(align) / PAGE_SIZE;
    let num_frames = wanted.max(MIN_GROWTH);

    let start = frame_allocator::alloc_pages(num_frames).ok_or(Error::NoMemory)?;
    let vaddr = crate::mm::frame_allocator::paddr_to_vaddr(start);
    // Safety: `start..start + num_frames * PAGE_SIZE` was just allocated
    // from the frame manager and is never freed back while the heap
    // holds it.
    unsafe { heap.add_to_heap(vaddr, PAGE_SIZE * num_frames) };
    Ok(())
}
