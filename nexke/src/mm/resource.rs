// SPDX-License-Identifier: MPL-2.0

//! Resource-ID arena: an integer ID allocator with a chunked bitmap and
//! a small known-free cache.
//!
//! Each 64-id-wide slice of the id space that has ever seen an
//! individual `free` gets its own [`ChunkKind::Mapped`] bitmap chunk,
//! tracked with the vendored [`id_alloc::IdAlloc`]; the
//! arena otherwise starts as a single unfragmented [`ChunkKind::Ranged`]
//! span that hands out ids sequentially until the first `free` forces a
//! chunk to materialize.

use alloc::string::String;
use alloc::vec::Vec;

use id_alloc::IdAlloc;

use crate::config::RESOURCE_FREE_CACHE_LEN;
use crate::sync::SpinLock;

enum ChunkKind {
    /// An unfragmented span; `next` is the next sequential id to hand
    /// out. Only ever the arena's initial chunk.
    Ranged { next: u64, high: u64 },
    /// A 64-id bitmap plus a cache of ids known to be free, so repeat
    /// alloc/free pairs in the same 64-id slice don't re-scan the
    /// bitmap every time.
    Mapped {
        bits: IdAlloc,
        free_cache: Vec<u64>,
    },
}

struct Chunk {
    base: u64,
    free_count: usize,
    kind: ChunkKind,
}

struct Inner {
    chunks: Vec<Chunk>,
    /// Indices into `chunks`, kept sorted descending by free count; the
    /// head is the allocation target.
    order: Vec<usize>,
    /// `chunk.base % N` → indices into `chunks`, for O(1) `free` lookup.
    hash: [Vec<(u64, usize)>; crate::config::RESOURCE_CHUNK_HASH_BUCKETS],
}

impl Inner {
    fn hash_bucket(base: u64) -> usize {
        (base % crate::config::RESOURCE_CHUNK_HASH_BUCKETS as u64) as usize
    }

    fn find_mapped(&self, base: u64) -> Option<usize> {
        self.hash[Self::hash_bucket(base)]
            .iter()
            .find(|(b, _)| *b == base)
            .map(|(_, idx)| *idx)
    }

    fn resort(&mut self) {
        let chunks = &self.chunks;
        self.order.sort_by(|&a, &b| chunks[b].free_count.cmp(&chunks[a].free_count));
    }
}

/// An integer ID allocator over `[min_id, max_id)`.
pub struct ResourceArena {
    #[allow(dead_code)]
    name: String,
    min_id: u64,
    inner: SpinLock<Inner>,
}

impl ResourceArena {
    /// Creates a fresh arena with a single `RANGED` chunk covering the
    /// whole range, `max_id` rounded up to a multiple of 64.
    pub fn create(name: &str, min_id: u64, max_id: u64) -> Self {
        let rounded_high = (max_id).next_multiple_of(64).max(min_id);
        let chunk = Chunk {
            base: min_id,
            free_count: (rounded_high - min_id) as usize,
            kind: ChunkKind::Ranged {
                next: min_id,
                high: rounded_high,
            },
        };
        Self {
            name: String::from(name),
            min_id,
            inner: SpinLock::new(Inner {
                chunks: alloc::vec![chunk],
                order: alloc::vec![0],
                hash: core::array::from_fn(|_| Vec::new()),
            }),
        }
    }

    /// Allocates the next available id, or `None` if the arena is
    /// exhausted.
    pub fn alloc(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        let &head = inner.order.first()?;
        if inner.chunks[head].free_count == 0 {
            return None;
        }

        let id = match &mut inner.chunks[head].kind {
            ChunkKind::Ranged { next, high } => {
                let id = *next;
                debug_assert!(id < *high);
                *next += 1;
                id
            }
            ChunkKind::Mapped { bits, free_cache } => {
                if let Some(offset) = free_cache.pop() {
                    bits.alloc_specific(offset as usize);
                    inner.chunks[head].base + offset
                } else {
                    let offset = bits.alloc()?;
                    // Opportunistically cache a few more known-free
                    // offsets from the same bitmap so the next few
                    // allocs in this chunk skip the scan entirely.
                    let mut cached = 0;
                    for candidate in offset + 1..64 {
                        if cached >= RESOURCE_FREE_CACHE_LEN {
                            break;
                        }
                        if !bits.is_allocated(candidate) {
                            free_cache.push(candidate as u64);
                            cached += 1;
                        }
                    }
                    inner.chunks[head].base + offset as u64
                }
            }
        };
        inner.chunks[head].free_count -= 1;
        inner.resort();
        Some(id)
    }

    /// Returns `id` to circulation. If no chunk yet covers `id`'s
    /// 64-id-aligned slice, one is created with every other id in the
    /// slice marked allocated.
    pub fn free(&self, id: u64) {
        let base = id & !63;
        let mut inner = self.inner.lock();
        let idx = match inner.find_mapped(base) {
            Some(idx) => idx,
            None => {
                let mut bits = IdAlloc::with_capacity(64);
                for _ in 0..64 {
                    bits.alloc();
                }
                let idx = inner.chunks.len();
                inner.chunks.push(Chunk {
                    base,
                    free_count: 0,
                    kind: ChunkKind::Mapped {
                        bits,
                        free_cache: Vec::new(),
                    },
                });
                inner.order.push(idx);
                let bucket = Inner::hash_bucket(base);
                inner.hash[bucket].push((base, idx));
                idx
            }
        };
        let offset = (id - base) as usize;
        if let ChunkKind::Mapped { bits, .. } = &mut inner.chunks[idx].kind {
            bits.free(offset);
        }
        inner.chunks[idx].free_count += 1;
        inner.resort();
    }

    pub fn min_id(&self) -> u64 {
        self.min_id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip_recycles_a_freed_id() {
        // create(0, 255), exhaust the ranged chunk, free one id,
        // observe it comes back.
        let arena = ResourceArena::create("test", 0, 255);
        for expect in 0..256u64 {
            assert_eq!(arena.alloc(), Some(expect));
        }
        assert_eq!(arena.alloc(), None);

        arena.free(7);
        assert_eq!(arena.alloc(), Some(7));
        assert_eq!(arena.alloc(), None);
    }

    #[test]
    fn free_cache_serves_repeated_alloc_free_without_rescans() {
        let arena = ResourceArena::create("test", 0, 63);
        for expect in 0..64u64 {
            assert_eq!(arena.alloc(), Some(expect));
        }
        arena.free(3);
        arena.free(9);
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        assert_ne!(a, b);
        assert!((a == 3 || a == 9) && (b == 3 || b == 9));
    }
}
