// SPDX-License-Identifier: MPL-2.0

//! Zone-table construction and the frame-manager public contract.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use align_ext::AlignExt;
use log::{info, warn};
use spin::Once;

use crate::boot::memory_region::{MemoryRegion, MemoryRegionType};
use crate::boot::BootInfo;
use crate::config::{BELOW_4G_LIMIT, ISA_DMA_LIMIT, PAGE_SIZE, PHYS_OFFSET};
use crate::mm::frame::{FrameRecord, FrameState, Zone, ZoneFlags};
use crate::mm::Paddr;

static FRAME_MANAGER: Once<FrameManager> = Once::new();

struct FrameManager {
    zones: Vec<Zone>,
    /// Cached index of the last-known largest free, generically
    /// allocatable zone; re-validated on every `alloc_page`.
    hint: AtomicUsize,
}

#[derive(Clone, Copy)]
struct ZoneSpec {
    pfn_base: usize,
    count: usize,
    flags: ZoneFlags,
}

/// Builds the zone table from the firmware memory map and brings the
/// frame manager up. Must run exactly once, before any other `mm` entry
/// point.
///
/// # Safety
///
/// `boot_info` must describe physical memory accurately; this function
/// trusts it without independent verification.
pub unsafe fn init(boot_info: &BootInfo) {
    let mut specs = zone_specs_from_regions(&boot_info.memory_regions);
    specs = merge_adjacent(specs);
    apply_platform_splits(&mut specs);

    let zones: Vec<Zone> = specs
        .into_iter()
        .map(|s| {
            if s.flags.contains(ZoneFlags::ALLOCATABLE) {
                info!(
                    "zone [{:#x}, {:#x}) flags {:?}",
                    s.pfn_base * PAGE_SIZE,
                    (s.pfn_base + s.count) * PAGE_SIZE,
                    s.flags
                );
            }
            Zone::new(s.pfn_base, s.count, s.flags)
        })
        .collect();

    FRAME_MANAGER.call_once(|| FrameManager {
        zones,
        hint: AtomicUsize::new(0),
    });
}

fn zone_specs_from_regions(regions: &[MemoryRegion]) -> Vec<ZoneSpec> {
    let mut specs = Vec::with_capacity(regions.len());
    for region in regions {
        let base = region.base().align_up(PAGE_SIZE);
        let end = (region.base() + region.len()).align_down(PAGE_SIZE);
        if end <= base {
            continue;
        }
        let flags = match region.typ() {
            MemoryRegionType::Free => ZoneFlags::ALLOCATABLE,
            MemoryRegionType::Mmio => ZoneFlags::MMIO,
            MemoryRegionType::Reserved | MemoryRegionType::AcpiNvs => ZoneFlags::RESERVED,
            MemoryRegionType::AcpiReclaim => ZoneFlags::RECLAIMABLE,
            MemoryRegionType::FwReclaim | MemoryRegionType::BootReclaim => ZoneFlags::ALLOCATABLE,
        };
        specs.push(ZoneSpec {
            pfn_base: base / PAGE_SIZE,
            count: (end - base) / PAGE_SIZE,
            flags,
        });
    }
    specs.sort_by_key(|s| s.pfn_base);

    let mut out: Vec<ZoneSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        if let Some(last) = out.last() {
            if spec.pfn_base < last.pfn_base + last.count {
                warn!(
                    "dropping overlapping memory map entry at pfn {:#x}",
                    spec.pfn_base
                );
                continue;
            }
        }
        out.push(spec);
    }
    out
}

fn merge_adjacent(specs: Vec<ZoneSpec>) -> Vec<ZoneSpec> {
    let mut merged: Vec<ZoneSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        if let Some(last) = merged.last_mut() {
            if last.pfn_base + last.count == spec.pfn_base && last.flags == spec.flags {
                last.count += spec.count;
                continue;
            }
        }
        merged.push(spec);
    }
    merged
}

/// PC platform split: frames below the ISA DMA and
/// below-4G cutoffs are marked `NO_GENERIC`, protecting them from
/// implicit general allocation so legacy DMA-capable devices can still
/// find addressable memory.
fn apply_platform_splits(specs: &mut Vec<ZoneSpec>) {
    mark_no_generic_below(specs, ISA_DMA_LIMIT / PAGE_SIZE);
    mark_no_generic_below(specs, BELOW_4G_LIMIT / PAGE_SIZE);
}

fn mark_no_generic_below(specs: &mut Vec<ZoneSpec>, boundary_pfn: usize) {
    let mut i = 0;
    while i < specs.len() {
        let spec = specs[i];
        let eligible = spec.flags.contains(ZoneFlags::ALLOCATABLE) && spec.pfn_base < boundary_pfn;
        if !eligible {
            i += 1;
            continue;
        }
        if spec.pfn_base + spec.count <= boundary_pfn {
            specs[i].flags |= ZoneFlags::NO_GENERIC;
            i += 1;
        } else {
            let low_count = boundary_pfn - spec.pfn_base;
            specs[i] = ZoneSpec {
                count: low_count,
                flags: spec.flags | ZoneFlags::NO_GENERIC,
                ..spec
            };
            specs.insert(
                i + 1,
                ZoneSpec {
                    pfn_base: boundary_pfn,
                    count: spec.count - low_count,
                    flags: spec.flags,
                },
            );
            i += 2;
        }
    }
}

fn manager() -> &'static FrameManager {
    FRAME_MANAGER.get().expect("frame manager not initialized")
}

/// Serves one free frame from the largest allocatable, non-`NO_GENERIC`
/// zone.
pub fn alloc_page() -> Option<Paddr> {
    alloc_pages(1)
}

/// Serves `count` contiguous frames from the largest allocatable,
/// non-`NO_GENERIC` zone.
pub fn alloc_pages(count: usize) -> Option<Paddr> {
    let mgr = manager();
    let hint = mgr.hint.load(Ordering::Relaxed);
    if let Some(pfn) = try_zone(mgr, hint, count, 1) {
        return Some(pfn * PAGE_SIZE);
    }
    // Hint was stale; rescan for the largest eligible zone.
    let mut best: Option<(usize, usize)> = None;
    for (i, zone) in mgr.zones.iter().enumerate() {
        if zone.flags().contains(ZoneFlags::ALLOCATABLE)
            && !zone.flags().contains(ZoneFlags::NO_GENERIC)
        {
            let free = zone.free_count();
            if best.map_or(true, |(_, best_free)| free > best_free) {
                best = Some((i, free));
            }
        }
    }
    let (index, _) = best?;
    mgr.hint.store(index, Ordering::Relaxed);
    try_zone(mgr, index, count, 1).map(|pfn| pfn * PAGE_SIZE)
}

fn try_zone(mgr: &FrameManager, index: usize, count: usize, align_pages: usize) -> Option<usize> {
    mgr.zones.get(index)?.alloc_pages(count, align_pages)
}

/// Finds `count` contiguous frames aligned to `align` bytes, all below
/// `max_addr`. No zone is excluded for `NO_GENERIC` here: that rule
/// only bans *implicit* general allocation. A zone that straddles
/// `max_addr` is not skipped outright — only frames at or above the
/// bound are off-limits, not the whole zone.
pub fn alloc_pages_at(count: usize, max_addr: Paddr, align: usize) -> Option<Paddr> {
    let mgr = manager();
    let max_pfn = max_addr / PAGE_SIZE;
    let align_pages = (align / PAGE_SIZE).max(1);
    for zone in &mgr.zones {
        if !zone.flags().contains(ZoneFlags::ALLOCATABLE) {
            continue;
        }
        if zone.pfn_base() >= max_pfn {
            continue;
        }
        if let Some(pfn) = zone.alloc_pages_below(count, align_pages, max_pfn) {
            return Some(pfn * PAGE_SIZE);
        }
    }
    None
}

/// A reference to a physical page's frame record, or a synthesized
/// stand-in for a PFN outside any allocatable zone — lookup never
/// fails.
pub enum FrameHandle {
    Managed(&'static FrameRecord),
    Unusable,
}

impl FrameHandle {
    pub fn state(&self) -> FrameState {
        match self {
            FrameHandle::Managed(_) => FrameState::InObject,
            FrameHandle::Unusable => FrameState::Unusable,
        }
    }
}

/// Returns the canonical frame record for any PFN.
pub fn find_page_pfn(pfn: usize) -> FrameHandle {
    let mgr = manager();
    let idx = mgr
        .zones
        .partition_point(|z| z.pfn_base() + z.count() <= pfn);
    match mgr.zones.get(idx) {
        Some(zone) if zone.pfn_base() <= pfn && zone.flags().contains(ZoneFlags::ALLOCATABLE) => {
            FrameHandle::Managed(zone.frame_at(pfn))
        }
        _ => FrameHandle::Unusable,
    }
}

/// Returns a single frame to its zone's free list.
pub fn free_page(paddr: Paddr) {
    free_pages(paddr, 1);
}

/// Returns `count` contiguous frames to their zone's free list.
pub fn free_pages(paddr: Paddr, count: usize) {
    let mgr = manager();
    let pfn = paddr / PAGE_SIZE;
    let idx = mgr
        .zones
        .partition_point(|z| z.pfn_base() + z.count() <= pfn);
    if let Some(zone) = mgr.zones.get(idx) {
        if zone.pfn_base() <= pfn {
            zone.free_pages(pfn, count);
        }
    }
}

/// Translates a physical address to its kernel linear-mapped virtual
/// address, once the kernel arena's physical-offset map is active.
pub fn paddr_to_vaddr(paddr: Paddr) -> usize {
    paddr + PHYS_OFFSET
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::boot::memory_region::MemoryRegion;

    #[test]
    fn zone_specs_classify_by_region_type_and_drop_overlaps() {
        let regions = [
            MemoryRegion::new(0, 0x2000, MemoryRegionType::Free),
            // Overlaps the entry above; must be dropped, not merged.
            MemoryRegion::new(0x1000, 0x2000, MemoryRegionType::Free),
            MemoryRegion::new(0x2000, 0x1000, MemoryRegionType::Mmio),
        ];
        let specs = zone_specs_from_regions(&regions);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].pfn_base, 0);
        assert_eq!(specs[0].count, 2);
        assert!(specs[0].flags.contains(ZoneFlags::ALLOCATABLE));
        assert_eq!(specs[1].pfn_base, 2);
        assert!(specs[1].flags.contains(ZoneFlags::MMIO));
    }

    #[test]
    fn merge_adjacent_joins_same_flag_runs_only() {
        let specs = alloc::vec![
            ZoneSpec { pfn_base: 0, count: 4, flags: ZoneFlags::ALLOCATABLE },
            ZoneSpec { pfn_base: 4, count: 4, flags: ZoneFlags::ALLOCATABLE },
            ZoneSpec { pfn_base: 8, count: 4, flags: ZoneFlags::RESERVED },
        ];
        let merged = merge_adjacent(specs);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].pfn_base, 0);
        assert_eq!(merged[0].count, 8);
        assert_eq!(merged[1].pfn_base, 8);
    }

    #[test]
    fn platform_split_marks_no_generic_only_below_boundary() {
        let mut specs = alloc::vec![ZoneSpec {
            pfn_base: 0,
            count: 0x2000,
            flags: ZoneFlags::ALLOCATABLE,
        }];
        mark_no_generic_below(&mut specs, 0x1000);
        assert_eq!(specs.len(), 2);
        assert!(specs[0].flags.contains(ZoneFlags::NO_GENERIC));
        assert_eq!(specs[0].count, 0x1000);
        assert!(!specs[1].flags.contains(ZoneFlags::NO_GENERIC));
        assert_eq!(specs[1].pfn_base, 0x1000);
        assert_eq!(specs[1].count, 0x1000);
    }
}
