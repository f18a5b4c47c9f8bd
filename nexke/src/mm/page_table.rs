// SPDX-License-Identifier: MPL-2.0

//! Machine-independent page-table manager.
//!
//! The walker operates on an opaque [`PageTableEntryTrait`]/
//! [`PageTableFlagsTrait`] pair so a second architecture could plug in
//! its own PTE encoding without touching this file; x86_64 is the only
//! implementation today ([`crate::arch::x86_64::mmu`]).

use alloc::vec::Vec;

use crate::arch::x86_64::mmu::{self, PageTableEntry, PageTableFlags};
use crate::config::{MAX_PTCACHE, PAGE_TABLE_LEVELS, PTCACHE_MIN_LOW_PRIORITY};
use crate::mm::{Paddr, Vaddr};
use crate::sync::SpinLock;

/// A page-table entry, opaque to everything above this layer.
pub trait PageTableEntryTrait: Copy + Clone + core::fmt::Debug {
    type Flags: PageTableFlagsTrait;

    fn new(paddr: Paddr, flags: Self::Flags) -> Self;
    fn paddr(&self) -> Paddr;
    fn flags(&self) -> Self::Flags;
    fn is_present(&self) -> bool;
    fn clear(&mut self);
}

/// The per-architecture flag bits an entry carries, abstracted behind the
/// portable permission set ([`PagePerm`]) the rest of the kernel deals in.
pub trait PageTableFlagsTrait: Copy + Clone {
    fn new() -> Self;
    fn set_present(self, present: bool) -> Self;
    fn set_writable(self, writable: bool) -> Self;
    fn set_executable(self, executable: bool) -> Self;
    fn set_user(self, user: bool) -> Self;
    fn set_cache_disabled(self, disabled: bool) -> Self;
    fn set_write_through(self, write_through: bool) -> Self;
    fn is_present(&self) -> bool;
    fn is_writable(&self) -> bool;
    fn is_user(&self) -> bool;
}

bitflags::bitflags! {
    /// Per-page permission set surfaced through the MMU API.
    pub struct PagePerm: u32 {
        const READABLE      = 1 << 0;
        const WRITABLE      = 1 << 1;
        const EXECUTABLE    = 1 << 2;
        /// Accessible only while running in the kernel address space.
        const KERNEL        = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const WRITE_THROUGH = 1 << 5;
    }
}

impl Default for PagePerm {
    fn default() -> Self {
        Self::READABLE
    }
}

/// Whether a table-cache entry may be evicted to make room for another.
///
/// Upper page-table levels are tagged `High` so a long walk does not
/// evict its own ancestors; `raise_ipl`-style nesting is mirrored here by
/// only letting a `High` entry evict another `High` one when enough `Low`
/// entries exist to keep the low-priority floor intact.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CachePriority {
    Low,
    High,
}

#[derive(Clone, Copy)]
struct CacheEntry {
    in_use: bool,
    priority: CachePriority,
    target: Option<Paddr>,
}

/// A per-address-space page-table mapping-window cache.
///
/// Each entry reserves one virtual page, permanently backed by a PTE the
/// cache owns outright ([`mmu::window_set`]), so re-targeting it at a
/// different physical page-table frame is one PTE write plus one
/// `invlpg`. `slot_base` is this space's disjoint slice of the global
/// window-slot pool bootstrapped once at [`mmu::bootstrap_windows`].
pub struct PtCache {
    slot_base: usize,
    entries: [CacheEntry; MAX_PTCACHE],
    free: Vec<usize>,
    in_use_order: Vec<usize>,
    low_priority_count: usize,
}

impl PtCache {
    fn new(slot_base: usize) -> Self {
        Self {
            slot_base,
            entries: [CacheEntry {
                in_use: false,
                priority: CachePriority::Low,
                target: None,
            }; MAX_PTCACHE],
            free: (0..MAX_PTCACHE).collect(),
            in_use_order: Vec::new(),
            low_priority_count: MAX_PTCACHE,
        }
    }

    /// Checks out a window and points it at `target`, evicting an
    /// existing entry if the cache is full.
    ///
    /// Returns the local entry index (not the global slot) so the caller
    /// can index [`Self::vaddr`] and eventually [`Self::release`] it.
    ///
    /// # Panics
    ///
    /// If no entry can be evicted. A future SMP/blocking implementation
    /// would block here instead; today it is fatal.
    fn acquire(&mut self, priority: CachePriority, target: Paddr) -> usize {
        let index = match self.free.pop() {
            Some(i) => i,
            None => self.evict(priority),
        };
        if self.entries[index].priority == CachePriority::Low && priority == CachePriority::High {
            self.low_priority_count -= 1;
        } else if self.entries[index].priority == CachePriority::High
            && priority == CachePriority::Low
        {
            self.low_priority_count += 1;
        }
        self.entries[index] = CacheEntry {
            in_use: true,
            priority,
            target: Some(target),
        };
        self.in_use_order.push(index);
        // Safety: `index` is one of this space's own disjoint window slots.
        unsafe { mmu::window_set(self.slot_base + index, Some(target)) };
        index
    }

    fn evict(&mut self, wanted: CachePriority) -> usize {
        for pos in (0..self.in_use_order.len()).rev() {
            let idx = self.in_use_order[pos];
            let entry = &self.entries[idx];
            if entry.in_use {
                continue;
            }
            let evictable = match entry.priority {
                CachePriority::Low => true,
                CachePriority::High => {
                    wanted == CachePriority::High
                        && self.low_priority_count >= PTCACHE_MIN_LOW_PRIORITY
                }
            };
            if evictable {
                self.in_use_order.remove(pos);
                // Safety: the slot is not in use and is being re-targeted.
                unsafe { mmu::window_set(self.slot_base + idx, None) };
                return idx;
            }
        }
        panic!("page-table mapping-window cache exhausted");
    }

    /// Releases a checked-out entry. The window keeps pointing at its
    /// last target (cheap to reuse) until evicted for another mapping.
    fn release(&mut self, index: usize) {
        self.entries[index].in_use = false;
    }

    fn vaddr(&self, index: usize) -> Vaddr {
        mmu::window_vaddr(self.slot_base + index)
    }
}

/// Allocates the next free per-space slot base out of the global window
/// pool, bounded by the number of concurrently live address spaces.
fn alloc_slot_base() -> usize {
    static NEXT: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
    let slot = NEXT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    assert!(
        (slot + 1) * MAX_PTCACHE <= mmu::total_window_slots(),
        "exceeded MAX_ADDRESS_SPACES worth of page-table windows"
    );
    slot * MAX_PTCACHE
}

/// The portable page-table manager for one address space.
pub struct PageTable {
    root: Paddr,
    cache: SpinLock<PtCache>,
}

impl PageTable {
    /// Creates a fresh, empty top-level table.
    pub fn new() -> Self {
        let root = mmu::alloc_table().expect("out of memory allocating a top-level page table");
        Self {
            root,
            cache: SpinLock::with_ipl(
                PtCache::new(alloc_slot_base()),
                crate::trap::ipl::IPL_HIGH,
            ),
        }
    }

    pub fn root_paddr(&self) -> Paddr {
        self.root
    }

    /// Walks to the leaf PTE for `vaddr`, allocating intermediate tables
    /// as needed, and writes `PageTableEntry::new(phys, flags)` there.
    pub fn map_page(&self, vaddr: Vaddr, phys: Paddr, perm: PagePerm) {
        let flags = mmu::flags_from_perm(perm).set_present(true);
        let mut cache = self.cache.lock();
        let mut table_paddr = self.root;
        let mut parent_flags = PageTableFlags::new().set_user(true).set_present(true);
        for level in (2..=PAGE_TABLE_LEVELS).rev() {
            let priority = if level == PAGE_TABLE_LEVELS {
                CachePriority::High
            } else {
                CachePriority::Low
            };
            let entry_idx = cache.acquire(priority, table_paddr);
            let window = cache.vaddr(entry_idx) as *mut PageTableEntry;
            let idx = mmu::page_index(vaddr, level);
            // Safety: the window is exclusively pointed at `table_paddr`.
            let pte = unsafe { &mut *window.add(idx) };
            if !pte.is_present() {
                let new_table = mmu::alloc_table().expect("out of memory for page tables");
                let child_flags = PageTableFlags::new()
                    .set_present(true)
                    .set_writable(true)
                    .set_user(!perm.contains(PagePerm::KERNEL));
                assert!(
                    mmu::verify(parent_flags, child_flags),
                    "attempted to install a user page table beneath a kernel one"
                );
                *pte = PageTableEntry::new(new_table, child_flags);
            }
            assert!(
                mmu::verify(parent_flags, pte.flags()),
                "attempted to install a user page table beneath a kernel one"
            );
            parent_flags = pte.flags();
            table_paddr = pte.paddr();
            cache.release(entry_idx);
        }
        let entry_idx = cache.acquire(CachePriority::Low, table_paddr);
        let window = cache.vaddr(entry_idx) as *mut PageTableEntry;
        let idx = mmu::page_index(vaddr, 1);
        assert!(
            mmu::verify(parent_flags, flags),
            "attempted to install a user leaf mapping beneath a kernel table"
        );
        // Safety: the window is exclusively pointed at the leaf table.
        unsafe { *window.add(idx) = PageTableEntry::new(phys, flags) };
        cache.release(entry_idx);
        mmu::tlb_flush(vaddr);
    }

    /// Walks to the leaf PTE for `vaddr` and clears it, if present.
    /// Never allocates.
    pub fn unmap_page(&self, vaddr: Vaddr) {
        let mut cache = self.cache.lock();
        let Some(leaf) = self.walk_readonly(&mut cache, vaddr) else {
            return;
        };
        let window = cache.vaddr(leaf.entry_idx) as *mut PageTableEntry;
        // Safety: the window is exclusively pointed at the leaf table.
        unsafe { (*window.add(leaf.pte_idx)).clear() };
        cache.release(leaf.entry_idx);
        mmu::tlb_flush(vaddr);
    }

    /// Returns the physical frame mapped at `vaddr`, if any. Never
    /// allocates.
    pub fn get_mapping(&self, vaddr: Vaddr) -> Option<Paddr> {
        let mut cache = self.cache.lock();
        let leaf = self.walk_readonly(&mut cache, vaddr)?;
        let window = cache.vaddr(leaf.entry_idx) as *const PageTableEntry;
        // Safety: the window is exclusively pointed at the leaf table.
        let entry = unsafe { &*window.add(leaf.pte_idx) };
        let paddr = entry.is_present().then(|| entry.paddr());
        cache.release(leaf.entry_idx);
        paddr
    }

    fn walk_readonly(&self, cache: &mut PtCache, vaddr: Vaddr) -> Option<LeafLocation> {
        let mut table_paddr = self.root;
        for level in (2..=PAGE_TABLE_LEVELS).rev() {
            let priority = if level == PAGE_TABLE_LEVELS {
                CachePriority::High
            } else {
                CachePriority::Low
            };
            let entry_idx = cache.acquire(priority, table_paddr);
            let window = cache.vaddr(entry_idx) as *const PageTableEntry;
            let idx = mmu::page_index(vaddr, level);
            // Safety: the window is exclusively pointed at `table_paddr`.
            let pte = unsafe { &*window.add(idx) };
            if !pte.is_present() {
                cache.release(entry_idx);
                return None;
            }
            table_paddr = pte.paddr();
            cache.release(entry_idx);
        }
        let entry_idx = cache.acquire(CachePriority::Low, table_paddr);
        Some(LeafLocation {
            entry_idx,
            pte_idx: mmu::page_index(vaddr, 1),
        })
    }
}

struct LeafLocation {
    entry_idx: usize,
    pte_idx: usize,
}

impl Drop for PageTable {
    fn drop(&mut self) {
        // Leaf and intermediate table frames are owned by the address
        // space's VM object teardown, which runs before this drops;
        // only the top-level frame is ours.
        frame_free_table(self.root);
    }
}

fn frame_free_table(paddr: Paddr) {
    crate::mm::frame_allocator::free_page(paddr);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_index_splits_four_levels_of_nine_bits() {
        let vaddr = 0x0000_1234_5678_9000usize;
        for level in 1..=4 {
            assert!(mmu::page_index(vaddr, level) < 512);
        }
    }
}
