// SPDX-License-Identifier: MPL-2.0

//! Slab allocator and the size-class general allocator built on top of
//! it.
//!
//! Internal caches (one slab page) store their [`SlabHeader`] in the
//! last bytes of the slab's own page, resolved back from an object
//! address by a page-align-down — no side table needed. External
//! caches (a slab spanning more than one page) keep the header on the
//! heap and resolve through a small hash table keyed by slab base.
//! Slab backing
//! pages come straight from [`crate::mm::frame_allocator`] through the
//! kernel's linear map, the same way [`super::heap_allocator`]'s rescue
//! grows the ordinary heap, rather than through the page-table manager.

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{
    PAGE_SIZE, SLAB_EMPTY_THRESHOLD, SLAB_GENERIC_MAX_CLASSES, SLAB_GENERIC_MAX_SIZE,
};
use crate::mm::frame_allocator;
use crate::prelude::*;
use crate::sync::SpinLock;

const EXTERNAL_HASH_BUCKETS: usize = 64;

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Per-slab control block.
struct SlabHeader {
    base: Vaddr,
    free_list: Option<NonNull<FreeNode>>,
    avail: usize,
}

struct Inner {
    empty: Vec<NonNull<SlabHeader>>,
    partial: Vec<NonNull<SlabHeader>>,
    full: Vec<NonNull<SlabHeader>>,
    color_next: usize,
    /// External caches only: slab base → header, `base % N` bucketed.
    hash: [Vec<(Vaddr, NonNull<SlabHeader>)>; EXTERNAL_HASH_BUCKETS],
}

// Safety: every `NonNull<SlabHeader>` reachable from `Inner` is only ever
// touched while the cache's `SpinLock` is held.
unsafe impl Send for Inner {}

/// A cache of fixed-size, fixed-alignment objects.
pub struct SlabCache {
    obj_size: usize,
    align: usize,
    slab_pages: usize,
    max_obj: usize,
    color_max: usize,
    external: bool,
    inner: SpinLock<Inner>,
    num_objects: AtomicUsize,
}

fn slab_pages_for(obj_size: usize) -> usize {
    if obj_size <= PAGE_SIZE / 8 {
        1
    } else {
        (obj_size * 8).div_ceil(PAGE_SIZE).next_power_of_two()
    }
}

impl SlabCache {
    pub fn new(obj_size: usize, align: usize) -> Self {
        let align = align.max(1);
        let obj_size = obj_size.max(size_of::<FreeNode>()).next_multiple_of(align);
        let slab_pages = slab_pages_for(obj_size);
        let external = slab_pages > 1;
        let header_reserve = if external { 0 } else { size_of::<SlabHeader>() };
        let usable = slab_pages * PAGE_SIZE - header_reserve;
        let max_obj = (usable / obj_size).max(1);
        let color_max = (usable % obj_size).max(1);
        Self {
            obj_size,
            align,
            slab_pages,
            max_obj,
            color_max,
            external,
            inner: SpinLock::new(Inner {
                empty: Vec::new(),
                partial: Vec::new(),
                full: Vec::new(),
                color_next: 0,
                hash: core::array::from_fn(|_| Vec::new()),
            }),
            num_objects: AtomicUsize::new(0),
        }
    }

    pub fn object_size(&self) -> usize {
        self.obj_size
    }

    /// Allocates one object, growing the cache by one slab if both the
    /// partial and empty lists are exhausted.
    pub fn alloc(&self) -> Option<Vaddr> {
        let mut inner = self.inner.lock();
        let slab = match inner.partial.last().copied() {
            Some(s) => s,
            None => match inner.empty.pop() {
                Some(s) => {
                    inner.partial.push(s);
                    s
                }
                None => {
                    let s = self.grow(&mut inner)?;
                    inner.partial.push(s);
                    s
                }
            },
        };

        // Safety: `slab` came from one of this cache's lists, each
        // entry of which is a live header for the duration it is
        // listed.
        let header = unsafe { &mut *slab.as_ptr() };
        let node = header.free_list.take()?;
        header.free_list = unsafe { (*node.as_ptr()).next };
        header.avail -= 1;
        if header.avail == 0 {
            inner.partial.retain(|s| *s != slab);
            inner.full.push(slab);
        }
        self.num_objects.fetch_add(1, Ordering::Relaxed);
        Some(node.as_ptr() as Vaddr)
    }

    /// Returns an object to its slab, possibly moving the slab between
    /// the full/partial/empty lists and releasing surplus empty slabs
    /// back to the frame manager.
    pub fn free(&self, addr: Vaddr) {
        let mut inner = self.inner.lock();
        let slab = self.resolve(&inner, addr);
        let header = unsafe { &mut *slab.as_ptr() };
        let was_full = header.avail == 0;

        let node = addr as *mut FreeNode;
        unsafe { (*node).next = header.free_list };
        header.free_list = NonNull::new(node);
        header.avail += 1;

        if was_full {
            inner.full.retain(|s| *s != slab);
            inner.partial.push(slab);
        }
        if header.avail == self.max_obj {
            inner.partial.retain(|s| *s != slab);
            inner.empty.push(slab);
            self.trim_empty(&mut inner);
        }
        self.num_objects.fetch_sub(1, Ordering::Relaxed);
    }

    fn resolve(&self, inner: &Inner, addr: Vaddr) -> NonNull<SlabHeader> {
        if self.external {
            let slab_size = self.slab_pages * PAGE_SIZE;
            let base = addr & !(slab_size - 1);
            let bucket = &inner.hash[base % EXTERNAL_HASH_BUCKETS];
            bucket
                .iter()
                .find(|(b, _)| *b == base)
                .map(|(_, h)| *h)
                .expect("slab_free: address not owned by this cache")
        } else {
            let base = addr & !(PAGE_SIZE - 1);
            NonNull::new((base + PAGE_SIZE - size_of::<SlabHeader>()) as *mut SlabHeader).unwrap()
        }
    }

    fn grow(&self, inner: &mut Inner) -> Option<NonNull<SlabHeader>> {
        let paddr = frame_allocator::alloc_pages(self.slab_pages)?;
        let base = frame_allocator::paddr_to_vaddr(paddr);

        let color = inner.color_next;
        inner.color_next = (color + self.align) % self.color_max;
        let area = base + color;

        let mut head: Option<NonNull<FreeNode>> = None;
        for i in (0..self.max_obj).rev() {
            let obj_addr = area + i * self.obj_size;
            let node = obj_addr as *mut FreeNode;
            // Safety: `obj_addr` lies within the freshly allocated,
            // otherwise-unowned slab pages.
            unsafe { node.write(FreeNode { next: head }) };
            head = NonNull::new(node);
        }

        let header = SlabHeader {
            base,
            free_list: head,
            avail: self.max_obj,
        };
        let header_ptr = if self.external {
            Box::into_raw(Box::new(header))
        } else {
            let hp = (base + PAGE_SIZE - size_of::<SlabHeader>()) as *mut SlabHeader;
            // Safety: the reserved tail of the slab's single page, not
            // otherwise handed out as object storage.
            unsafe { hp.write(header) };
            hp
        };
        let handle = NonNull::new(header_ptr)?;
        if self.external {
            let slab_size = self.slab_pages * PAGE_SIZE;
            inner.hash[base % EXTERNAL_HASH_BUCKETS].push((base & !(slab_size - 1), handle));
        }
        Some(handle)
    }

    fn trim_empty(&self, inner: &mut Inner) {
        while inner.empty.len() > SLAB_EMPTY_THRESHOLD {
            let Some(slab) = inner.empty.pop() else { break };
            // Safety: removed from every list; no other reference
            // survives past this point.
            let header = unsafe { Box::from_raw(slab.as_ptr()) };
            if self.external {
                let slab_size = self.slab_pages * PAGE_SIZE;
                let bucket = &mut inner.hash[header.base % EXTERNAL_HASH_BUCKETS];
                bucket.retain(|(b, _)| *b != header.base & !(slab_size - 1));
            }
            frame_allocator::free_pages(
                frame_to_paddr(header.base),
                self.slab_pages,
            );
            if !self.external {
                // The header lived inside the page we just freed; leak
                // the `Box` handle so its destructor does not run on
                // memory that no longer belongs to us.
                core::mem::forget(header);
            }
        }
    }
}

fn frame_to_paddr(vaddr: Vaddr) -> Paddr {
    vaddr - crate::config::PHYS_OFFSET
}

/// The size-class general allocator built on [`SlabCache`]: `malloc`
/// picks the smallest cache whose object size covers
/// the request; `free` requires the caller to state the size class.
pub struct GeneralAllocator {
    classes: Vec<SlabCache>,
}

impl GeneralAllocator {
    fn new(max_size: usize) -> Self {
        let mut classes = Vec::with_capacity(SLAB_GENERIC_MAX_CLASSES);
        let mut size = 16usize;
        while size <= max_size && classes.len() < SLAB_GENERIC_MAX_CLASSES {
            classes.push(SlabCache::new(size, size.min(PAGE_SIZE)));
            size *= 2;
        }
        Self { classes }
    }

    fn class_for(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.object_size() >= size)
    }

    pub fn malloc(&self, size: usize) -> Option<Vaddr> {
        self.classes[self.class_for(size)?].alloc()
    }

    pub fn free(&self, ptr: Vaddr, size: usize) {
        let idx = self.class_for(size).expect("free: size class out of range");
        self.classes[idx].free(ptr);
    }
}

static GENERAL: spin::Once<GeneralAllocator> = spin::Once::new();

/// Brings up the kernel-stage general allocator (size classes 16 B..=
/// [`SLAB_GENERIC_MAX_SIZE`]). Must run once, after the frame manager
/// and before any `malloc`/`free` call.
pub fn init() {
    GENERAL.call_once(|| GeneralAllocator::new(SLAB_GENERIC_MAX_SIZE));
}

pub fn malloc(size: usize) -> Option<Vaddr> {
    GENERAL.get().expect("slab allocator not initialized").malloc(size)
}

pub fn free(ptr: Vaddr, size: usize) {
    GENERAL.get().expect("slab allocator not initialized").free(ptr, size);
}

#[cfg(test)]
mod test {
    use std::alloc::{alloc, dealloc, Layout};

    use super::*;

    #[test]
    fn sizing_matches_one_page_internal_shape() {
        // A 64-byte object cache on one-page slabs should land on a
        // single internal (in-page-header) slab, not an external one.
        let cache = SlabCache::new(64, 8);
        assert!(!cache.external);
        assert_eq!(cache.slab_pages, 1);
        assert_eq!(cache.max_obj, (PAGE_SIZE - size_of::<SlabHeader>()) / 64);
    }

    /// Builds one internal-cache slab directly on a host-allocated,
    /// page-aligned buffer instead of going through `grow` (which draws
    /// pages from the frame manager through kernel virtual addresses
    /// this host test process cannot map), and seeds it straight onto
    /// the cache's partial list the same way `grow` would have.
    fn seed_one_slab(cache: &SlabCache) -> *mut u8 {
        assert!(!cache.external);
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // Safety: `layout` has non-zero size.
        let base = unsafe { alloc(layout) } as Vaddr;
        assert!(base != 0, "host page allocation failed");

        let mut head: Option<NonNull<FreeNode>> = None;
        for i in (0..cache.max_obj).rev() {
            let obj_addr = base + i * cache.obj_size;
            let node = obj_addr as *mut FreeNode;
            // Safety: `obj_addr` lies within the freshly allocated,
            // otherwise-unowned host page.
            unsafe { node.write(FreeNode { next: head }) };
            head = NonNull::new(node);
        }
        let header = SlabHeader {
            base,
            free_list: head,
            avail: cache.max_obj,
        };
        let header_ptr = (base + PAGE_SIZE - size_of::<SlabHeader>()) as *mut SlabHeader;
        // Safety: the reserved tail of the page, not handed out as
        // object storage.
        unsafe { header_ptr.write(header) };

        cache.inner.lock().partial.push(NonNull::new(header_ptr).unwrap());
        base as *mut u8
    }

    #[test]
    fn alloc_fills_a_slab_to_full_and_free_drains_it_back_to_empty() {
        let cache = SlabCache::new(64, 8);
        let base = seed_one_slab(&cache);

        let mut addrs = Vec::with_capacity(cache.max_obj);
        for _ in 0..cache.max_obj {
            addrs.push(cache.alloc().expect("seeded slab has room"));
        }
        assert_eq!(cache.num_objects.load(Ordering::Relaxed), cache.max_obj);
        assert!(cache.inner.lock().partial.is_empty());
        assert_eq!(cache.inner.lock().full.len(), 1);
        // A further `alloc()` would grow the cache by drawing a real
        // frame, which needs a live frame manager this host test has
        // none of; the full/partial transition above is already
        // exercised without it.

        for addr in addrs {
            cache.free(addr);
        }
        assert_eq!(cache.num_objects.load(Ordering::Relaxed), 0);
        assert!(cache.inner.lock().full.is_empty());
        assert_eq!(cache.inner.lock().empty.len(), 1);

        // Safety: `base` came from the matching `alloc` above and is no
        // longer referenced by the cache (the slab was never trimmed,
        // since one empty slab is under `SLAB_EMPTY_THRESHOLD`).
        unsafe { dealloc(base, Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()) };
    }

    #[test]
    fn general_allocator_malloc_free_round_trip_through_its_size_class() {
        let general = GeneralAllocator::new(256);
        let idx = general.class_for(64).unwrap();
        let base = seed_one_slab(&general.classes[idx]);

        let ptr = general.malloc(64).expect("seeded size class has room");
        assert_eq!(general.classes[idx].num_objects.load(Ordering::Relaxed), 1);
        general.free(ptr, 64);
        assert_eq!(general.classes[idx].num_objects.load(Ordering::Relaxed), 0);

        unsafe { dealloc(base, Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()) };
    }
}
