// SPDX-License-Identifier: MPL-2.0

//! VM objects, address spaces, and the page-fault handler.
//!
//! Each [`AddressSpace`] tracks its mapped ranges as a `BTreeMap<Vaddr,
//! SpaceEntry>`, each entry backed by an [`VmObject`] that owns a page
//! hash shared by every address space that maps it; pages are
//! populated lazily through [`page_fault`] rather than up front.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use crate::config::{KERNEL_SPACE_ID, OBJECT_PAGE_HASH_BUCKETS, PAGE_SIZE};
use crate::mm::frame_allocator::{self, FrameHandle};
use crate::mm::page_table::{PagePerm, PageTable};
use crate::mm::{Paddr, Vaddr};
use crate::prelude::*;
use crate::sync::SpinLock;

/// The per-backend behavior a [`VmObject`] dispatches to. `KernelMemory`
/// is the only backend
/// this kernel core defines: non-pageable, page-in never evicts and
/// never blocks, destroy is a no-op beyond the generic frame walk
/// [`VmObject::destroy`] already performs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Backend {
    KernelMemory,
}

/// One slot in a [`VmObject`]'s page hash.
#[derive(Clone, Copy)]
enum PageState {
    Resident(Paddr),
    /// A deliberately unbacked page: faulting on it always fails.
    /// Not populated by any backend today; reserved for a
    /// future mapper that wants to punch a hole in an otherwise
    /// contiguous object.
    Guard,
}

struct PageHash {
    buckets: [Vec<(usize, PageState)>; OBJECT_PAGE_HASH_BUCKETS],
}

impl PageHash {
    fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| Vec::new()),
        }
    }

    fn bucket_of(offset: usize) -> usize {
        (offset / PAGE_SIZE) % OBJECT_PAGE_HASH_BUCKETS
    }

    fn get(&self, offset: usize) -> Option<PageState> {
        self.buckets[Self::bucket_of(offset)]
            .iter()
            .find(|(o, _)| *o == offset)
            .map(|(_, s)| *s)
    }

    fn insert(&mut self, offset: usize, state: PageState) {
        self.buckets[Self::bucket_of(offset)].push((offset, state));
    }

    fn remove(&mut self, offset: usize) -> Option<PageState> {
        let bucket = &mut self.buckets[Self::bucket_of(offset)];
        let idx = bucket.iter().position(|(o, _)| *o == offset)?;
        Some(bucket.swap_remove(idx).1)
    }

    fn iter(&self) -> impl Iterator<Item = (usize, PageState)> + '_ {
        self.buckets.iter().flatten().map(|(o, s)| (*o, *s))
    }
}

/// A pageable (or, today, always-resident) byte-addressable backing
/// store exposed into one or more address spaces. Reference-counted
/// through `Arc` rather than a hand-rolled `refCount` field plus manual
/// `ref`/`deref` calls, so [`VmObject::create`] hands out an
/// `Arc<VmObject>` directly.
pub struct VmObject {
    backend: Backend,
    perm: PagePerm,
    pages: usize,
    hash: SpinLock<PageHash>,
}

impl VmObject {
    /// Allocates and initializes a fresh object.
    pub fn create(pages: usize, backend: Backend, perm: PagePerm) -> Arc<Self> {
        Arc::new(Self {
            backend,
            perm,
            pages,
            hash: SpinLock::new(PageHash::new()),
        })
    }

    pub fn permissions(&self) -> PagePerm {
        self.perm
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Looks up `(self, offset)` in the page hash; if absent, allocates
    /// a frame and calls the backend's page-in. Fails with
    /// [`Error::AccessDenied`] if the slot is
    /// a guard page, [`Error::NoMemory`] if a frame could not be found.
    pub fn fault_in(&self, offset: usize) -> Result<Paddr> {
        let mut hash = self.hash.lock();
        match hash.get(offset) {
            Some(PageState::Resident(paddr)) => Ok(paddr),
            Some(PageState::Guard) => Err(Error::AccessDenied),
            None => {
                let paddr = match self.backend {
                    // Page-in is a no-op beyond handing back a fresh,
                    // zero-filled frame: `KernelMemory` never pages out.
                    Backend::KernelMemory => frame_allocator::alloc_page().ok_or(Error::NoMemory)?,
                };
                hash.insert(offset, PageState::Resident(paddr));
                Ok(paddr)
            }
        }
    }

    /// Marks `offset` as a guard page: any future fault on it fails
    /// without ever allocating a frame.
    pub fn insert_guard(&self, offset: usize) {
        self.hash.lock().insert(offset, PageState::Guard);
    }

    /// Removes one resident page and returns its frame to the frame
    /// manager. The caller is responsible for
    /// unmapping the page from any address space first; this only
    /// forgets the object's own record of it.
    pub fn release_page(&self, offset: usize) {
        if let Some(PageState::Resident(paddr)) = self.hash.lock().remove(offset) {
            frame_allocator::free_page(paddr);
        }
    }

    /// Walks the page hash, clears every reverse mapping (unmapping the
    /// page from every space that mapped it) and frees the pages.
    /// Called once the last `Arc` reference is dropped.
    fn destroy(&self) {
        let hash = self.hash.lock();
        for (_, state) in hash.iter() {
            let PageState::Resident(paddr) = state else {
                continue;
            };
            if let FrameHandle::Managed(frame) = frame_allocator::find_page_pfn(paddr / PAGE_SIZE) {
                for (space_id, vaddr) in frame.mappings() {
                    if let Some(space) = AddressSpace::lookup(space_id) {
                        space.page_table.unmap_page(vaddr);
                    }
                    frame.remove_mapping(space_id, vaddr);
                }
            }
            frame_allocator::free_page(paddr);
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A mapping of a virtual range to `(object, offset)` within one address
/// space.
#[derive(Clone)]
struct SpaceEntry {
    base: Vaddr,
    size: usize,
    object: Arc<VmObject>,
    object_offset: usize,
    perm: PagePerm,
}

impl SpaceEntry {
    fn contains(&self, vaddr: Vaddr) -> bool {
        vaddr >= self.base && vaddr < self.base + self.size
    }
}

/// {start, end, space entries, MMU state}. The MMU-state record is
/// [`PageTable`], which itself owns the
/// top-level table base and the PT mapping-window cache.
pub struct AddressSpace {
    id: usize,
    start: Vaddr,
    end: Vaddr,
    entries: SpinLock<Vec<SpaceEntry>>,
    page_table: PageTable,
}

static KERNEL_SPACE: Once<Arc<AddressSpace>> = Once::new();

impl AddressSpace {
    fn new(id: usize, start: Vaddr, end: Vaddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            start,
            end,
            entries: SpinLock::new(Vec::new()),
            page_table: PageTable::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn start(&self) -> Vaddr {
        self.start
    }

    pub fn end(&self) -> Vaddr {
        self.end
    }

    /// Registers a space entry mapping `[base, base+size)` to
    /// `(object, object_offset)`. Does not fault any page in; that
    /// happens lazily through [`page_fault`].
    pub fn map(&self, base: Vaddr, size: usize, object: Arc<VmObject>, object_offset: usize, perm: PagePerm) {
        self.entries.lock().push(SpaceEntry {
            base,
            size,
            object,
            object_offset,
            perm,
        });
    }

    /// Removes the space entry starting at `base`, if any.
    pub fn unmap(&self, base: Vaddr) {
        self.entries.lock().retain(|e| e.base != base);
    }

    fn find_entry(&self, vaddr: Vaddr) -> Option<SpaceEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.contains(vaddr))
            .cloned()
    }

    /// Looks up a live address space by its id. Only the kernel space
    /// exists today (no user-space ABI), so this
    /// is a one-entry table; a future per-process table would extend
    /// this without changing callers.
    fn lookup(id: usize) -> Option<Arc<AddressSpace>> {
        if id == KERNEL_SPACE_ID {
            KERNEL_SPACE.get().cloned()
        } else {
            None
        }
    }
}

/// Brings up the process-wide kernel address space singleton. Must run
/// once, after the frame manager and page-table window bootstrap.
pub fn init(start: Vaddr, end: Vaddr) {
    KERNEL_SPACE.call_once(|| AddressSpace::new(KERNEL_SPACE_ID, start, end));
}

pub fn kernel_space() -> &'static Arc<AddressSpace> {
    KERNEL_SPACE.get().expect("kernel address space not initialized")
}

bitflags::bitflags! {
    /// The hardware fault reason passed into [`page_fault`].
    /// `PRESENT` mirrors the CPU's "page present" error-code bit:
    /// set, the fault is a permission violation on an existing mapping;
    /// clear, it is an access to an unmapped address.
    pub struct FaultProt: u32 {
        const KERNEL  = 1 << 0;
        const WRITE   = 1 << 1;
        const PRESENT = 1 << 2;
    }
}

/// The page-fault entry point. Aligns
/// `vaddr` down, resolves the faulting space entry, faults the backing
/// page in, and maps it with the object's declared permissions.
///
/// There is no copy-on-write path, so a fresh (not-present) fault is
/// always resolved by installing the object's declared permissions. A
/// present-but-violating fault (the hardware's `PRESENT` bit set) is
/// only resolved the same way if the access the hardware reports
/// (`WRITE`) is actually something the object's permissions grant;
/// otherwise the access is a real violation and the fault is
/// propagated as an error rather than silently re-mapped with the same
/// permissions it already had.
pub fn page_fault(vaddr: Vaddr, prot: FaultProt) -> Result<()> {
    let vaddr = vaddr & !(PAGE_SIZE - 1);
    if !prot.contains(FaultProt::KERNEL) {
        // No user address spaces exist yet.
        return Err(Error::PageFault);
    }
    let space = kernel_space();
    let entry = space.find_entry(vaddr).ok_or(Error::PageFault)?;

    if prot.contains(FaultProt::PRESENT) {
        let wants_write = prot.contains(FaultProt::WRITE);
        let explained = !wants_write || entry.perm.contains(PagePerm::WRITABLE);
        if !explained {
            return Err(Error::AccessDenied);
        }
    }

    let offset = entry.object_offset + (vaddr - entry.base);
    let paddr = entry.object.fault_in(offset)?;

    space.page_table.map_page(vaddr, paddr, entry.perm);
    if let FrameHandle::Managed(frame) = frame_allocator::find_page_pfn(paddr / PAGE_SIZE) {
        frame.add_mapping(space.id(), vaddr);
    }
    Ok(())
}

static NEXT_ADDRESS_SPACE_ID: AtomicUsize = AtomicUsize::new(KERNEL_SPACE_ID + 1);

/// Reserves a fresh address-space id for a future non-kernel space. Not
/// used today (user-space ABI is out of scope) but kept so
/// [`crate::mm::frame::FrameRecord`]'s reverse-mapping key space is
/// ready for it without renumbering the kernel singleton.
pub fn alloc_space_id() -> usize {
    NEXT_ADDRESS_SPACE_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_hash_insert_get_remove_round_trips() {
        let mut hash = PageHash::new();
        hash.insert(0x4000, PageState::Resident(0x1000));
        assert!(matches!(hash.get(0x4000), Some(PageState::Resident(0x1000))));
        hash.insert(0x8000, PageState::Guard);
        assert!(matches!(hash.get(0x8000), Some(PageState::Guard)));
        assert!(matches!(hash.remove(0x4000), Some(PageState::Resident(0x1000))));
        assert!(hash.get(0x4000).is_none());
    }
}
