// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

use log::Level;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;
pub const ENTRY_COUNT: usize = 512;

pub const KERNEL_HEAP_SIZE: usize = PAGE_SIZE * 256;

pub const KERNEL_OFFSET: usize = 0xffff_ffff_8000_0000;
pub const PHYS_OFFSET: usize = 0xffff_8000_0000_0000;

pub const DEFAULT_LOG_LEVEL: Level = Level::Info;

/// Base frequency of the timer scheduler's hardware clock, in Hz.
pub const TIMER_FREQ: u64 = 1000;

/// Number of page-table mapping-window cache entries per address space.
/// Sized generously: a 4-level walk needs at most 4 live windows,
/// plus headroom so concurrent walks on other CPUs don't starve.
pub const MAX_PTCACHE: usize = 16;

/// Minimum number of low-priority PT-cache entries that must exist before
/// a high-priority entry is allowed to evict another high-priority one.
pub const PTCACHE_MIN_LOW_PRIORITY: usize = 2;

/// KV arena bucket boundaries, in pages: 1-4, 5-8, 9-16, 17-32, 33+.
pub const KV_BUCKET_BOUNDARIES: [usize; 4] = [4, 8, 16, 32];
pub const KV_NUM_BUCKETS: usize = 5;

/// Magic word stamped into a KV region's footer so left-coalescing can
/// distinguish a real footer from adjacent free bytes.
pub const KV_FOOTER_MAGIC: u32 = 0x4b56_464f; // "KVFO"

/// Number of slabs kept on a cache's empty list before surplus slabs are
/// returned to the frame manager.
pub const SLAB_EMPTY_THRESHOLD: usize = 3;

/// Below this physical address, frames are off-limits to implicit general
/// allocation (ISA DMA zone), per the PC platform split.
pub const ISA_DMA_LIMIT: usize = 16 * 1024 * 1024;

/// Below this physical address, frames are off-limits to implicit general
/// allocation unless the caller explicitly asks for them (legacy 32-bit
/// device limit), per the PC platform split.
pub const BELOW_4G_LIMIT: usize = 0x1_0000_0000;

/// Small free-id cache size inside a MAPPED resource-arena chunk.
pub const RESOURCE_FREE_CACHE_LEN: usize = 6;

/// Upper bound on the number of CPUs the per-CPU arrays (timer event
/// lists, IPL, interrupt counters) are sized for. SMP startup itself is
/// out of scope; this only keeps the per-CPU data
/// layout ready for it rather than hard-wiring a single CPU everywhere.
pub const MAX_CPUS: usize = 1;

/// Maximum number of object-cache size classes the general allocator
/// built on the slab layer maintains, powers of two from 16 bytes up.
/// 16 covers 16 B..=512 KiB, comfortably above the kernel's own
/// 8192-byte size-class floor.
pub const SLAB_GENERIC_MAX_CLASSES: usize = 16;

/// Largest size class, in bytes, the kernel-stage general allocator
/// serves directly from a slab cache. Requests larger than this go
/// straight to the frame manager / KV arena instead of through a
/// size-class cache.
pub const SLAB_GENERIC_MAX_SIZE: usize = 8192;

/// Fixed bucket count for a VM object's page hash table.
pub const OBJECT_PAGE_HASH_BUCKETS: usize = 64;

/// Fixed bucket count for the resource arena's chunk-lookup hash table.
pub const RESOURCE_CHUNK_HASH_BUCKETS: usize = 64;

/// Number of page-table levels walked by the portable page-table manager.
/// 4 matches the x86_64 non-LA57 mode; LA57 (5-level) is not
/// wired up (see DESIGN.md).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Upper bound on the number of address spaces that can exist
/// concurrently, used only to size the reserved virtual range backing
/// every space's page-table mapping-window cache. SMP/multi-process
/// support is out of scope; this just keeps
/// each space's cache windows disjoint without a dynamic allocator for
/// kernel virtual ranges that predates the KV arena's own bootstrap.
pub const MAX_ADDRESS_SPACES: usize = 64;

/// Base of the reserved virtual range backing every address space's
/// page-table mapping-window cache. Each space gets a
/// `MAX_PTCACHE`-page slice starting at
/// `PT_CACHE_WINDOW_BASE + slot * MAX_PTCACHE * PAGE_SIZE`.
pub const PT_CACHE_WINDOW_BASE: usize = 0xffff_fe00_0000_0000;

/// Base and size (in pages) of the demand-paged kernel KV arena.
/// Disjoint from [`PT_CACHE_WINDOW_BASE`]'s range and from
/// [`KERNEL_OFFSET`].
pub const KERNEL_ARENA_BASE: usize = 0xffff_c000_0000_0000;
pub const KERNEL_ARENA_PAGES: usize = 0x10_0000; // 4 GiB of kernel virtual address space

/// The single kernel address space's id, used as the non-owning key
/// stamped into a frame's reverse-mapping list.
pub const KERNEL_SPACE_ID: usize = 0;
