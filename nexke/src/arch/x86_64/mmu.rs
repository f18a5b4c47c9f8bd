// SPDX-License-Identifier: MPL-2.0

//! The x86_64 MMU layer: PTE encoding, early boot mapping,
//! TLB invalidation, and the low-level "window" primitive the portable
//! page-table manager ([`crate::mm::page_table`]) builds its
//! mapping-window cache on top of.
//!
//! This is the only architecture-specific piece of the memory subsystem;
//! everything above this module deals in [`PagePerm`] and opaque frame
//! numbers, never in PTE bits directly.

use core::sync::atomic::{AtomicUsize, Ordering};

use align_ext::AlignExt;
use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
    PhysAddr, VirtAddr,
};

use crate::config::{MAX_ADDRESS_SPACES, PAGE_SIZE, PT_CACHE_WINDOW_BASE};
use crate::mm::frame_allocator;
use crate::mm::page_table::{PageTableEntryTrait, PageTableFlagsTrait};
use crate::mm::{Paddr, Vaddr};

bitflags::bitflags! {
    /// Raw x86_64 PTE bits, at canonical positions for both
    /// 4- and 5-level paging.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageTableFlags: usize {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlagsTrait for PageTableFlags {
    fn new() -> Self {
        Self::empty()
    }

    fn set_present(mut self, present: bool) -> Self {
        self.set(Self::PRESENT, present);
        self
    }

    fn set_writable(mut self, writable: bool) -> Self {
        self.set(Self::WRITABLE, writable);
        self
    }

    fn set_executable(mut self, executable: bool) -> Self {
        self.set(Self::NO_EXECUTE, !executable);
        self
    }

    fn set_user(mut self, user: bool) -> Self {
        self.set(Self::USER, user);
        self
    }

    fn set_cache_disabled(mut self, disabled: bool) -> Self {
        self.set(Self::NO_CACHE, disabled);
        self
    }

    fn set_write_through(mut self, wt: bool) -> Self {
        self.set(Self::WRITE_THROUGH, wt);
        self
    }

    fn is_present(&self) -> bool {
        self.contains(Self::PRESENT)
    }

    fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    fn is_user(&self) -> bool {
        self.contains(Self::USER)
    }
}

/// An x86_64 page-table entry: a 51:12 physical address plus flag bits.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
}

impl PageTableEntryTrait for PageTableEntry {
    type Flags = PageTableFlags;

    fn new(paddr: Paddr, flags: PageTableFlags) -> Self {
        Self((paddr as u64 & Self::PHYS_ADDR_MASK) | flags.bits() as u64)
    }

    fn paddr(&self) -> Paddr {
        (self.0 & Self::PHYS_ADDR_MASK) as Paddr
    }

    fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 as usize)
    }

    fn is_present(&self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() as u64 != 0
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("paddr", &self.paddr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Rejects installing a user-accessible PTE beneath a non-user (kernel)
/// one. `parent` is the entry one level up the walk from `child`.
pub fn verify(parent: PageTableFlags, child: PageTableFlags) -> bool {
    !(child.is_user() && !parent.is_user())
}

/// Number of the index bits consumed per page-table level.
const LEVEL_SHIFT: usize = 9;
const LEVEL_MASK: usize = (1 << LEVEL_SHIFT) - 1;

/// Returns the index into a page-table page at `level` (1 = leaf, 4 =
/// top) for `vaddr`.
pub fn page_index(vaddr: Vaddr, level: usize) -> usize {
    debug_assert!((1..=4).contains(&level));
    (vaddr >> (12 + LEVEL_SHIFT * (level - 1))) & LEVEL_MASK
}

/// Invalidates the TLB entry for a single page.
pub fn tlb_flush(vaddr: Vaddr) {
    x86_64::instructions::tlb::flush(VirtAddr::new(vaddr as u64));
}

/// Invalidates the entire TLB, including global pages.
pub fn tlb_flush_all() {
    x86_64::instructions::tlb::flush_all();
}

/// Reads the physical address of the currently active top-level table.
pub fn current_root() -> Paddr {
    Cr3::read().0.start_address().as_u64() as Paddr
}

/// Switches the active top-level table. The caller must ensure `root` is
/// a valid, fully populated top-level page-table frame.
///
/// # Safety
///
/// Switching CR3 can immediately invalidate the mappings the current
/// instruction stream depends on if `root` is not set up correctly.
pub unsafe fn activate(root: Paddr) {
    // Safety: delegated to the caller.
    unsafe {
        Cr3::write(
            PhysFrame::from_start_address(PhysAddr::new(root as u64)).unwrap(),
            Cr3Flags::empty(),
        );
    }
}

/// Allocates and zeroes a fresh page-table frame from the frame manager.
pub fn alloc_table() -> Option<Paddr> {
    let frame = frame_allocator::alloc_page()?;
    zero_page(frame);
    Some(frame)
}

/// Zeroes a physical page in place via its boot-identity/linear-offset
/// mapping. Used only for freshly allocated page-table frames, which
/// `alloc_table` draws from the frame manager's own pool and which are
/// therefore always within the range `map_early` can already reach (see
/// module docs and DESIGN.md for the boot-identity assumption).
pub fn zero_page(paddr: Paddr) {
    let vaddr = early_identity(paddr);
    // Safety: `paddr` was just handed back by the frame manager, so the
    // page is exclusively ours, and the boot-identity window covers it.
    unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, PAGE_SIZE) };
}

/// During early boot (before the KV arena and its demand-paged kernel
/// arena exist) and for manipulating page-table frames directly, the
/// kernel relies on the firmware leaving low physical memory identity
/// mapped in the page tables it hands off (true of every x86_64 boot
/// protocol this workspace targets: long mode requires *some* mapping
/// covering the code that enables paging, and bootloaders conventionally
/// extend that to cover all memory below 4 GiB). `early_identity` is the
/// single place that assumption is named.
fn early_identity(paddr: Paddr) -> Vaddr {
    paddr
}

/// Converts a portable [`PagePerm`](crate::mm::page_table::PagePerm) set
/// into the x86_64-specific flag bits.
pub fn flags_from_perm(perm: crate::mm::page_table::PagePerm) -> PageTableFlags {
    use crate::mm::page_table::PagePerm;
    PageTableFlags::new()
        .set_writable(perm.contains(PagePerm::WRITABLE))
        .set_executable(perm.contains(PagePerm::EXECUTABLE))
        .set_user(!perm.contains(PagePerm::KERNEL))
        .set_cache_disabled(perm.contains(PagePerm::CACHE_DISABLE))
        .set_write_through(perm.contains(PagePerm::WRITE_THROUGH))
}

/// Installs a mapping for `virt -> phys` before the kernel arena and its
/// page-table mapping-window cache exist, walking (and allocating, as
/// needed) the table chain directly through the boot-identity window.
///
/// # Safety
///
/// Must only be called before the window cache takes over general
/// mapping duties, and `virt`/`phys` must be page aligned.
pub unsafe fn map_early(virt: Vaddr, phys: Paddr, perm: crate::mm::page_table::PagePerm) {
    assert!(virt.is_aligned(PAGE_SIZE) && phys.is_aligned(PAGE_SIZE));
    let flags = flags_from_perm(perm).set_present(true);
    let mut table_paddr = current_root();
    for level in (2..=4).rev() {
        let table = early_identity(table_paddr) as *mut PageTableEntry;
        let idx = page_index(virt, level);
        // Safety: `table` is a live page-table page within the identity window.
        let entry = unsafe { &mut *table.add(idx) };
        if !entry.is_present() {
            let new_table = alloc_table().expect("map_early: out of memory for page tables");
            *entry = PageTableEntry::new(
                new_table,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER,
            );
        }
        table_paddr = entry.paddr();
    }
    let table = early_identity(table_paddr) as *mut PageTableEntry;
    let idx = page_index(virt, 1);
    // Safety: as above, the leaf table page is within the identity window.
    unsafe { *table.add(idx) = PageTableEntry::new(phys, flags) };
    tlb_flush(virt);
}

/// Resolves a mapping installed by [`map_early`] or by the window cache
/// directly, without going through the portable walker.
pub fn get_phys_early(virt: Vaddr) -> Option<Paddr> {
    let mut table_paddr = current_root();
    for level in (2..=4).rev() {
        let table = early_identity(table_paddr) as *const PageTableEntry;
        let idx = page_index(virt, level);
        // Safety: the chain was built by `map_early`, within the identity window.
        let entry = unsafe { &*table.add(idx) };
        if !entry.is_present() {
            return None;
        }
        table_paddr = entry.paddr();
    }
    let table = early_identity(table_paddr) as *const PageTableEntry;
    let idx = page_index(virt, 1);
    // Safety: as above.
    let entry = unsafe { &*table.add(idx) };
    entry.is_present().then(|| entry.paddr() | (virt & (PAGE_SIZE - 1)))
}

/// One reserved virtual page backing a page-table mapping-window cache
/// entry, plus the address of the PTE that maps it. Bootstrapped once by
/// [`bootstrap_windows`]; after that, re-pointing a window at a new
/// physical target is a single store plus an `invlpg`.
#[derive(Clone, Copy)]
struct WindowSlot {
    vaddr: Vaddr,
    pte: *mut PageTableEntry,
}

// Safety: `pte` always points at a permanently reserved, never-freed
// page-table leaf built during `bootstrap_windows`; access is serialized
// by the owning `PtCache`'s lock.
unsafe impl Sync for WindowSlot {}

static WINDOW_SLOTS: spin::Once<alloc::vec::Vec<WindowSlot>> = spin::Once::new();
static BOOTSTRAPPED: AtomicUsize = AtomicUsize::new(0);

/// Total number of window slots across every address space's cache.
pub fn total_window_slots() -> usize {
    MAX_ADDRESS_SPACES * crate::config::MAX_PTCACHE
}

/// Builds the permanent page-table chain backing every address space's
/// window cache. Must run once, after the frame manager is initialized
/// and before any `PtCache` is used.
pub fn bootstrap_windows() {
    use crate::mm::page_table::PagePerm;

    WINDOW_SLOTS.call_once(|| {
        let mut slots = alloc::vec::Vec::with_capacity(total_window_slots());
        for i in 0..total_window_slots() {
            let vaddr = PT_CACHE_WINDOW_BASE + i * PAGE_SIZE;
            // Safety: building brand new, never-before-mapped kernel
            // windows; no data is present at `vaddr` to clobber.
            unsafe {
                map_early(
                    vaddr,
                    0, // placeholder target, marked not-present below
                    PagePerm::WRITABLE,
                );
            }
            let table_paddr = {
                let mut tp = current_root();
                for level in (2..=4).rev() {
                    let table = early_identity(tp) as *const PageTableEntry;
                    let idx = page_index(vaddr, level);
                    // Safety: chain was just built by `map_early` above.
                    tp = unsafe { (&*table.add(idx)).paddr() };
                }
                tp
            };
            let table = early_identity(table_paddr) as *mut PageTableEntry;
            let idx = page_index(vaddr, 1);
            // Safety: `table` is the permanently resident leaf built above.
            let pte = unsafe { table.add(idx) };
            // Safety: clearing PRESENT; the window starts unoccupied.
            unsafe { (*pte).clear() };
            tlb_flush(vaddr);
            slots.push(WindowSlot { vaddr, pte });
        }
        BOOTSTRAPPED.store(1, Ordering::Release);
        slots
    });
}

/// Returns the reserved virtual address for global window slot `index`.
pub fn window_vaddr(index: usize) -> Vaddr {
    WINDOW_SLOTS.get().expect("bootstrap_windows not called").as_slice()[index].vaddr
}

/// Re-points window slot `index` at `target` (or unmaps it if `None`).
///
/// # Safety
///
/// The caller must not hold any reference derived from the window's
/// previous target across this call.
pub unsafe fn window_set(index: usize, target: Option<Paddr>) {
    let slot = WINDOW_SLOTS.get().expect("bootstrap_windows not called")[index];
    // Safety: `slot.pte` is permanently reserved and access is serialized
    // by the cache's lock.
    unsafe {
        *slot.pte = match target {
            Some(paddr) => PageTableEntry::new(
                paddr,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            ),
            None => PageTableEntry::new(0, PageTableFlags::empty()),
        };
    }
    tlb_flush(slot.vaddr);
}
