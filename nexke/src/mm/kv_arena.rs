// SPDX-License-Identifier: MPL-2.0

//! Kernel virtual memory arena: a bucket allocator over a reserved
//! virtual range.
//!
//! Every region, free or allocated, gets a [`RegionNode`] keyed by its
//! start page offset in a `BTreeMap`, realized as ordinary kernel
//! heap metadata rather than virtual pages of its own, since nothing
//! outside this module ever needs to address a region directly.
//! Regions of two pages or more additionally get a footer entry keyed
//! by their *end* page offset, giving O(1) left-neighbor lookup on free
//! without a full predecessor search — the metadata equivalent of an
//! in-band footer word, but living in the same always-resident
//! array rather than written into memory that, for the demand-paged
//! kernel arena, might not be mapped yet.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::boot::BootInfo;
use crate::config::{
    KERNEL_ARENA_BASE, KERNEL_ARENA_PAGES, KV_BUCKET_BOUNDARIES, KV_FOOTER_MAGIC, KV_NUM_BUCKETS,
    PAGE_SIZE,
};
use crate::mm::frame_allocator;
use crate::mm::object::{self, Backend, VmObject};
use crate::mm::page_table::PagePerm;
use crate::mm::Vaddr;
use crate::sync::SpinLock;

#[derive(Clone, Copy)]
struct RegionNode {
    pages: usize,
    free: bool,
}

struct Inner {
    regions: BTreeMap<usize, RegionNode>,
    /// Keyed by end page offset (`start + pages - 1`); only present for
    /// regions of 2+ pages.
    footers: BTreeMap<usize, (u32, usize)>,
    buckets: [Vec<usize>; KV_NUM_BUCKETS],
}

fn bucket_of(pages: usize) -> usize {
    KV_BUCKET_BOUNDARIES
        .iter()
        .position(|&b| pages <= b)
        .unwrap_or(KV_NUM_BUCKETS - 1)
}

impl Inner {
    fn new(total_pages: usize) -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(0, RegionNode {
            pages: total_pages,
            free: true,
        });
        let mut footers = BTreeMap::new();
        if total_pages >= 2 {
            footers.insert(total_pages - 1, (KV_FOOTER_MAGIC, total_pages));
        }
        let mut buckets: [Vec<usize>; KV_NUM_BUCKETS] = Default::default();
        buckets[bucket_of(total_pages)].push(0);
        Self {
            regions,
            footers,
            buckets,
        }
    }

    fn remove_from_bucket(&mut self, pages: usize, start: usize) {
        let bucket = &mut self.buckets[bucket_of(pages)];
        if let Some(pos) = bucket.iter().position(|&s| s == start) {
            bucket.swap_remove(pos);
        }
    }

    fn set_footer(&mut self, start: usize, pages: usize) {
        if pages >= 2 {
            self.footers.insert(start + pages - 1, (KV_FOOTER_MAGIC, pages));
        }
    }

    fn clear_footer(&mut self, start: usize, pages: usize) {
        if pages >= 2 {
            self.footers.remove(&(start + pages - 1));
        }
    }

    /// Finds a free region of at least `pages`, first-fit within the
    /// smallest bucket that could hold it and upward.
    fn find_free(&self, pages: usize) -> Option<usize> {
        for b in bucket_of(pages)..KV_NUM_BUCKETS {
            if let Some(&start) = self
                .buckets[b]
                .iter()
                .find(|&&s| self.regions[&s].pages >= pages)
            {
                return Some(start);
            }
        }
        None
    }

    /// Reserves `pages` starting at a free region of at least that
    /// size, splitting the remainder back into the free buckets.
    /// Returns the start page offset of the newly allocated region.
    fn reserve(&mut self, pages: usize) -> Option<usize> {
        let start = self.find_free(pages)?;
        let node = self.regions[&start];
        self.remove_from_bucket(node.pages, start);
        self.clear_footer(start, node.pages);

        self.regions.insert(start, RegionNode { pages, free: false });
        self.set_footer(start, pages);

        if node.pages > pages {
            let rem_start = start + pages;
            let rem_pages = node.pages - pages;
            self.regions.insert(rem_start, RegionNode {
                pages: rem_pages,
                free: true,
            });
            self.set_footer(rem_start, rem_pages);
            self.buckets[bucket_of(rem_pages)].push(rem_start);
        }
        Some(start)
    }

    /// Marks the region at `start` free and coalesces with both
    /// neighbors, returning the final (possibly merged) region's start
    /// and page count.
    fn release(&mut self, start: usize) -> (usize, usize) {
        let mut node = self.regions.remove(&start).expect("freeing unknown KV region");
        node.free = true;
        self.clear_footer(start, node.pages);
        let mut base = start;
        let mut pages = node.pages;

        // Left neighbor: its footer, if any, sits one page before us.
        if base > 0 {
            if let Some(&(magic, left_pages)) = self.footers.get(&(base - 1)) {
                debug_assert_eq!(magic, KV_FOOTER_MAGIC);
                let left_start = base - left_pages;
                if self.regions.get(&left_start).is_some_and(|r| r.free) {
                    let left = self.regions.remove(&left_start).unwrap();
                    self.remove_from_bucket(left.pages, left_start);
                    self.clear_footer(left_start, left.pages);
                    base = left_start;
                    pages += left.pages;
                }
            }
        }

        // Right neighbor: region whose start equals our current end.
        let right_start = base + pages;
        if let Some(&right) = self.regions.get(&right_start) {
            if right.free {
                self.regions.remove(&right_start);
                self.remove_from_bucket(right.pages, right_start);
                self.clear_footer(right_start, right.pages);
                pages += right.pages;
            }
        }

        self.regions.insert(base, RegionNode { pages, free: true });
        self.set_footer(base, pages);
        self.buckets[bucket_of(pages)].push(base);
        (base, pages)
    }
}

/// One kernel virtual memory arena. `needs_map` arenas
/// fault pages in through `object` on allocation and release them on
/// free; non-`needs_map` arenas assume the whole range is already
/// backed by resident physical memory (the boot pool).
pub struct Arena {
    base: Vaddr,
    pages: usize,
    needs_map: bool,
    object: Option<Arc<VmObject>>,
    inner: SpinLock<Inner>,
}

/// Passed to [`Arena::alloc`] to skip demand-paging a `needs_map` arena's
/// allocation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    Now,
    NoDemand,
}

impl Arena {
    fn new(base: Vaddr, pages: usize, needs_map: bool, object: Option<Arc<VmObject>>) -> Self {
        Self {
            base,
            pages,
            needs_map,
            object,
            inner: SpinLock::new(Inner::new(pages)),
        }
    }

    fn contains(&self, vaddr: Vaddr) -> bool {
        vaddr >= self.base && vaddr < self.base + self.pages * PAGE_SIZE
    }

    pub fn alloc(&self, pages: usize, perm: PagePerm, demand: Demand) -> Option<Vaddr> {
        let start = self.inner.lock().reserve(pages)?;
        let base = self.base + start * PAGE_SIZE;
        if self.needs_map && demand == Demand::Now {
            let object = self.object.as_ref().expect("needs_map arena without backing object");
            for i in 0..pages {
                let vaddr = base + i * PAGE_SIZE;
                let offset = (start + i) * PAGE_SIZE;
                let paddr = object.fault_in(offset).ok()?;
                object::kernel_space().page_table().map_page(vaddr, paddr, perm);
                if let frame_allocator::FrameHandle::Managed(frame) =
                    frame_allocator::find_page_pfn(paddr / PAGE_SIZE)
                {
                    frame.add_mapping(crate::config::KERNEL_SPACE_ID, vaddr);
                }
            }
        }
        Some(base)
    }

    /// Reserves `pages` of virtual range and maps it directly to `phys`,
    /// bypassing the backing object entirely.
    pub fn alloc_mmio(&self, phys: crate::mm::Paddr, pages: usize, perm: PagePerm) -> Option<Vaddr> {
        let start = self.inner.lock().reserve(pages)?;
        let base = self.base + start * PAGE_SIZE;
        for i in 0..pages {
            object::kernel_space()
                .page_table()
                .map_page(base + i * PAGE_SIZE, phys + i * PAGE_SIZE, perm);
        }
        Some(base)
    }

    pub fn free(&self, vaddr: Vaddr) {
        let start = (vaddr - self.base) / PAGE_SIZE;
        let pages = self.inner.lock().regions.get(&start).map(|r| r.pages);
        let Some(pages) = pages else { return };

        if self.needs_map {
            let object = self.object.as_ref().expect("needs_map arena without backing object");
            for i in 0..pages {
                let page_vaddr = vaddr + i * PAGE_SIZE;
                let offset = (start + i) * PAGE_SIZE;
                if let Some(paddr) = object::kernel_space().page_table().get_mapping(page_vaddr) {
                    if let frame_allocator::FrameHandle::Managed(frame) =
                        frame_allocator::find_page_pfn(paddr / PAGE_SIZE)
                    {
                        frame.remove_mapping(crate::config::KERNEL_SPACE_ID, page_vaddr);
                    }
                }
                object::kernel_space().page_table().unmap_page(page_vaddr);
                object.release_page(offset);
            }
        }
        self.inner.lock().release(start);
    }
}

static BOOT_POOL: Once<Arena> = Once::new();
static KERNEL_ARENA: Once<Arena> = Once::new();

/// Brings up the boot-pool and kernel KV arenas. Must run after
/// [`object::init`] so the kernel arena's backing `VmObject` can be
/// created.
///
/// # Safety
///
/// Must run exactly once, with `boot_info` describing a boot pool range
/// that is physically resident and mapped for the remainder of this
/// boot.
pub fn init(boot_info: &BootInfo) {
    let pool_base = frame_allocator::paddr_to_vaddr(boot_info.boot_pool_base);
    let pool_pages = boot_info.boot_pool_size / PAGE_SIZE;
    BOOT_POOL.call_once(|| Arena::new(pool_base, pool_pages, false, None));

    object::init(KERNEL_ARENA_BASE, KERNEL_ARENA_BASE + KERNEL_ARENA_PAGES * PAGE_SIZE);
    let object = VmObject::create(KERNEL_ARENA_PAGES, Backend::KernelMemory, PagePerm::default());
    KERNEL_ARENA.call_once(|| Arena::new(KERNEL_ARENA_BASE, KERNEL_ARENA_PAGES, true, Some(object)));
}

fn boot_pool() -> &'static Arena {
    BOOT_POOL.get().expect("KV arena not initialized")
}

fn kernel_arena() -> &'static Arena {
    KERNEL_ARENA.get().expect("KV arena not initialized")
}

/// Walks the arenas (boot pool first, then the kernel arena) looking
/// for one that can satisfy the request.
pub fn alloc(pages: usize, perm: PagePerm, demand: Demand) -> Option<Vaddr> {
    boot_pool()
        .alloc(pages, perm, demand)
        .or_else(|| kernel_arena().alloc(pages, perm, demand))
}

pub fn alloc_mmio(phys: crate::mm::Paddr, pages: usize, perm: PagePerm) -> Option<Vaddr> {
    kernel_arena().alloc_mmio(phys, pages, perm)
}

pub fn free(vaddr: Vaddr) {
    if boot_pool().contains(vaddr) {
        boot_pool().free(vaddr);
    } else if kernel_arena().contains(vaddr) {
        kernel_arena().free(vaddr);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fragment_then_coalesce_merges_freed_neighbors() {
        // Exercised on a bare `Inner` so it needs no real frame manager
        // or page tables.
        let mut inner = Inner::new(1024);
        let a = inner.reserve(10).unwrap();
        let b = inner.reserve(100).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 10);

        let (start, pages) = inner.release(a);
        assert_eq!((start, pages), (0, 10));
        assert!(inner.buckets[bucket_of(10)].contains(&0));

        let (start, pages) = inner.release(b);
        // The freed [10, 110) region's left neighbor (our just-freed
        // 10-page region at 0) is free, so they merge into one 110-page
        // region starting at 0, landing in the 33+ bucket.
        assert_eq!(start, 0);
        assert_eq!(pages, 110);
        assert!(inner.buckets[KV_NUM_BUCKETS - 1].contains(&0));
    }

    #[test]
    fn single_page_regions_get_no_footer() {
        let inner = Inner::new(4);
        assert!(inner.footers.is_empty());
    }
}
