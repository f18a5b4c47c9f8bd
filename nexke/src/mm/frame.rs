// SPDX-License-Identifier: MPL-2.0

//! The physical frame database.
//!
//! Each usable physical page has exactly one [`FrameRecord`], held in a
//! dense, zone-owned array (the PFN map). A frame is on exactly one
//! list: its zone's free list, or the page hash of the object that owns
//! it — [`FrameRecord`] itself only carries the
//! object-hash link and the reverse-mapping list; the free/allocated
//! bookkeeping lives in the zone's backing [`buddy_system_allocator`]
//! instance.

use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::mm::{Paddr, Vaddr};
use crate::sync::SpinLock;

bitflags::bitflags! {
    /// Per-zone capability flags.
    pub struct ZoneFlags: u32 {
        const ALLOCATABLE = 1 << 0;
        const RESERVED     = 1 << 1;
        const MMIO         = 1 << 2;
        const RECLAIMABLE  = 1 << 3;
        const KERNEL       = 1 << 4;
        /// Off-limits to implicit general allocation (ISA DMA / below-4G
        /// carve-outs); still usable via `alloc_pages_at`.
        const NO_GENERIC   = 1 << 5;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameState {
    Free,
    InObject,
    /// Synthesized for PFNs outside any allocatable zone (e.g. MMIO),
    /// never backed by a real [`FrameRecord`].
    Unusable,
}

/// A non-owning link into a VM object's page hash: the object's address
/// as an opaque key, not a strong reference, which breaks what would
/// otherwise be a frame/object ownership cycle, plus the page's byte
/// offset within the object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObjectLink {
    pub object_key: usize,
    pub offset: usize,
}

#[derive(Default)]
struct FrameInner {
    obj_link: Option<ObjectLink>,
    /// Reverse mappings: every (address space, vaddr) this frame is
    /// currently mapped at. Non-empty only while mapped.
    maps: Vec<(usize, Vaddr)>,
}

/// The per-page control record in the PFN map.
pub struct FrameRecord {
    pfn: usize,
    inner: SpinLock<FrameInner>,
}

impl FrameRecord {
    fn new(pfn: usize) -> Self {
        Self {
            pfn,
            inner: SpinLock::new(FrameInner::default()),
        }
    }

    pub fn pfn(&self) -> usize {
        self.pfn
    }

    pub fn paddr(&self) -> Paddr {
        self.pfn * PAGE_SIZE
    }

    pub fn set_object_link(&self, link: Option<ObjectLink>) {
        self.inner.lock().obj_link = link;
    }

    pub fn object_link(&self) -> Option<ObjectLink> {
        self.inner.lock().obj_link
    }

    /// Records that `(space, vaddr)` now maps this frame.
    pub fn add_mapping(&self, space: usize, vaddr: Vaddr) {
        self.inner.lock().maps.push((space, vaddr));
    }

    /// Removes one `(space, vaddr)` mapping, if present.
    pub fn remove_mapping(&self, space: usize, vaddr: Vaddr) {
        self.inner.lock().maps.retain(|&m| m != (space, vaddr));
    }

    /// Returns every address space this frame is currently mapped into,
    /// for an object-destruction unmap walk.
    pub fn mappings(&self) -> Vec<(usize, Vaddr)> {
        self.inner.lock().maps.clone()
    }
}

/// A maximal contiguous range of PFNs sharing the same flags.
pub struct Zone {
    pfn_base: usize,
    count: usize,
    flags: ZoneFlags,
    alloc: SpinLock<buddy_system_allocator::FrameAllocator<32>>,
    frames: Vec<FrameRecord>,
    free_count: core::sync::atomic::AtomicUsize,
}

impl Zone {
    pub(crate) fn new(pfn_base: usize, count: usize, flags: ZoneFlags) -> Self {
        let mut alloc = buddy_system_allocator::FrameAllocator::<32>::new();
        let frames = if flags.contains(ZoneFlags::ALLOCATABLE) {
            alloc.add_frame(0, count);
            (0..count).map(|i| FrameRecord::new(pfn_base + i)).collect()
        } else {
            Vec::new()
        };
        Self {
            pfn_base,
            count,
            flags,
            alloc: SpinLock::new(alloc),
            frames,
            free_count: core::sync::atomic::AtomicUsize::new(if flags.contains(ZoneFlags::ALLOCATABLE) {
                count
            } else {
                0
            }),
        }
    }

    pub fn pfn_base(&self) -> usize {
        self.pfn_base
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn flags(&self) -> ZoneFlags {
        self.flags
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(core::sync::atomic::Ordering::Relaxed)
    }

    fn contains_pfn(&self, pfn: usize) -> bool {
        pfn >= self.pfn_base && pfn < self.pfn_base + self.count
    }

    fn frame(&self, pfn: usize) -> &FrameRecord {
        &self.frames[pfn - self.pfn_base]
    }

    /// Returns the frame record backing `pfn`, which must lie within
    /// this zone.
    pub(crate) fn frame_at(&self, pfn: usize) -> &FrameRecord {
        self.frame(pfn)
    }

    pub(crate) fn alloc_pages(&self, count: usize, align_pages: usize) -> Option<usize> {
        let order = count.next_power_of_two().max(align_pages.next_power_of_two());
        let mut alloc = self.alloc.lock();
        let start = alloc.alloc(order)?;
        if order > count {
            alloc.dealloc(start + count, order - count);
        }
        self.free_count
            .fetch_sub(count, core::sync::atomic::Ordering::Relaxed);
        for pfn in start..start + count {
            self.frame(self.pfn_base + pfn).set_object_link(None);
        }
        Some(self.pfn_base + start)
    }

    /// Like `alloc_pages`, but every frame of the result must lie below
    /// `max_pfn`. A candidate block the buddy allocator offers at or
    /// above `max_pfn` is freed back and retried rather than accepted,
    /// so a zone that straddles `max_pfn` can still serve a request out
    /// of its below-the-bound portion.
    pub(crate) fn alloc_pages_below(
        &self,
        count: usize,
        align_pages: usize,
        max_pfn: usize,
    ) -> Option<usize> {
        let order = count.next_power_of_two().max(align_pages.next_power_of_two());
        let mut alloc = self.alloc.lock();
        let mut rejected = Vec::new();
        let found = loop {
            match alloc.alloc(order) {
                Some(candidate) if self.pfn_base + candidate + count <= max_pfn => {
                    break Some(candidate)
                }
                Some(candidate) => rejected.push(candidate),
                None => break None,
            }
        };
        for candidate in rejected {
            alloc.dealloc(candidate, order);
        }
        let start = found?;
        if order > count {
            alloc.dealloc(start + count, order - count);
        }
        self.free_count
            .fetch_sub(count, core::sync::atomic::Ordering::Relaxed);
        for pfn in start..start + count {
            self.frame(self.pfn_base + pfn).set_object_link(None);
        }
        Some(self.pfn_base + start)
    }

    pub(crate) fn free_pages(&self, pfn: usize, count: usize) {
        let start = pfn - self.pfn_base;
        self.alloc.lock().dealloc(start, count.next_power_of_two());
        self.free_count
            .fetch_add(count, core::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zone_alloc_and_free_tracks_free_count() {
        let zone = Zone::new(0x100, 0x100, ZoneFlags::ALLOCATABLE);
        assert_eq!(zone.free_count(), 0x100);
        let a = zone.alloc_pages(1, 1).unwrap();
        let b = zone.alloc_pages(1, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(zone.free_count(), 0x100 - 2);
        zone.free_pages(a, 1);
        zone.free_pages(b, 1);
        assert_eq!(zone.free_count(), 0x100);
    }

    #[test]
    fn alloc_pages_below_succeeds_when_free_space_remains_under_the_bound() {
        let zone = Zone::new(0, 0x20, ZoneFlags::ALLOCATABLE);
        let pfn = zone
            .alloc_pages_below(4, 4, 0x10)
            .expect("room exists below the bound");
        assert!(pfn + 4 <= 0x10);
    }

    #[test]
    fn alloc_pages_below_rejects_once_the_only_free_room_is_above_the_bound() {
        let zone = Zone::new(0, 0x20, ZoneFlags::ALLOCATABLE);
        // Consume everything under pfn 0x10, leaving only frames at or
        // above the bound free.
        zone.alloc_pages(0x10, 1).unwrap();
        assert!(zone.alloc_pages_below(4, 4, 0x10).is_none());
    }
}
