//! Collaborator boundaries.
//!
//! - [`HostAllocator`] hands out host pages and maps whole chunks into the process.
//! - [`ExecutionManager`] is told about every backing change so it can fix up direct mappings.
//! - [`PageTablePool`] drops cached translations when a page or region moves.
//!
//! [`HeapAllocator`] is an in-process allocator that backs chunks with heap buffers; it is what
//! hosted builds without a kernel driver use.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::HostError;
use crate::page::{ChunkId, PageBacking, PageId, PageKind, Protection};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Address of host memory inside a chunk mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: a `HostPtr` is a plain address into a chunk mapping owned by the host allocator. It
// carries no ownership; the address space only dereferences it while the chunk is mapped and the
// address-space lock or a chunk reference keeps it alive.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Offsets the pointer. `offset` must stay within the mapping the pointer came from.
    #[inline]
    pub(crate) fn offset(self, offset: usize) -> Self {
        // SAFETY: callers only offset within a chunk mapping (or the zero page), so the result is
        // in bounds of the same allocation and therefore non-null.
        Self(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset)) })
    }
}

/// Host page allocator and chunk mapper.
///
/// Page ids encode their chunk: `page_id >> chunk_shift()` is the [`ChunkId`].
pub trait HostAllocator: Send + Sync {
    /// log2 of the number of pages in one chunk.
    fn chunk_shift(&self) -> u32;

    fn reserve_pages(&self, pages: u64) -> Result<(), HostError>;

    /// Allocates `count` zeroed pages. Either every page is allocated or none is.
    fn allocate_pages(&self, count: usize) -> Result<Vec<PageBacking>, HostError>;

    fn free_pages(&self, pages: &[PageId]) -> Result<(), HostError>;

    /// Maps a chunk into the current process and returns its base address.
    fn map_chunk(&self, chunk: ChunkId) -> Result<HostPtr, HostError>;

    fn unmap_chunk(&self, chunk: ChunkId) -> Result<(), HostError>;
}

/// A page descriptor's backing changed.
#[derive(Debug, Clone, Copy)]
pub struct PageChange {
    pub addr: u64,
    pub kind: PageKind,
    pub old_host_phys: Option<u64>,
    pub new_host_phys: Option<u64>,
    pub new_host_ptr: Option<HostPtr>,
    pub protection: Protection,
}

#[derive(Debug, Clone)]
pub struct RegionEvent {
    pub base: u64,
    pub size: u64,
    pub kind: PageKind,
    pub tag: String,
}

/// Native execution manager hooks.
///
/// Failures are logged and ignored unless the address space was configured with
/// `execution_manager_mandatory`.
pub trait ExecutionManager: Send + Sync {
    fn notify_page_changed(&self, change: &PageChange) -> Result<(), HostError>;

    fn notify_region_mapped(&self, event: &RegionEvent) -> Result<(), HostError>;

    fn notify_region_unmapped(&self, event: &RegionEvent) -> Result<(), HostError>;
}

/// Shadow page-table pool hooks.
pub trait PageTablePool: Send + Sync {
    /// Drops translations that reference the page at `addr`.
    fn invalidate_page(&self, addr: u64);

    /// Drops every cached translation.
    fn clear_all(&self);
}

/// Host-physical address handed out for heap pages. Purely synthetic.
const HEAP_HOST_PHYS_BASE: u64 = 0x10_0000_0000;

#[derive(Debug)]
struct HeapChunk {
    data: Box<[AtomicU8]>,
    in_use: Vec<bool>,
    free: Vec<u32>,
    used: u32,
    mapped: bool,
}

impl HeapChunk {
    fn new(pages: u32) -> Self {
        let bytes = (pages as usize) << PAGE_SHIFT;
        Self {
            data: (0..bytes).map(|_| AtomicU8::new(0)).collect(),
            in_use: vec![false; pages as usize],
            // Pop from the back so pages are handed out in ascending order.
            free: (0..pages).rev().collect(),
            used: 0,
            mapped: false,
        }
    }

    fn zero_page(&self, index: u32) {
        let start = (index as usize) << PAGE_SHIFT;
        for byte in &self.data[start..start + PAGE_SIZE as usize] {
            byte.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default)]
struct HeapState {
    chunks: BTreeMap<u32, HeapChunk>,
    next_chunk: u32,
    reserved: u64,
    allocated: u64,
    map_calls: u64,
    unmap_calls: u64,
}

/// Heap-backed [`HostAllocator`].
///
/// Chunks are created on demand and released once every page in them has been freed and the
/// chunk is no longer mapped. An optional page limit makes allocation fail with
/// [`HostError::OutOfMemory`] once that many pages are outstanding.
#[derive(Debug)]
pub struct HeapAllocator {
    chunk_shift: u32,
    page_limit: Option<u64>,
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    /// Chunk size used by hosted builds: 512 pages (2 MiB).
    pub const DEFAULT_CHUNK_SHIFT: u32 = 9;

    /// Largest supported chunk: 2^19 pages (2 GiB).
    pub const MAX_CHUNK_SHIFT: u32 = 19;

    /// `chunk_shift` is clamped to [`Self::MAX_CHUNK_SHIFT`].
    pub fn new(chunk_shift: u32) -> Self {
        Self {
            chunk_shift: chunk_shift.min(Self::MAX_CHUNK_SHIFT),
            page_limit: None,
            state: Mutex::new(HeapState::default()),
        }
    }

    pub fn with_page_limit(chunk_shift: u32, limit: u64) -> Self {
        Self {
            page_limit: Some(limit),
            ..Self::new(chunk_shift)
        }
    }

    fn state(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chunk_pages(&self) -> u32 {
        1 << self.chunk_shift
    }

    /// Pages currently allocated and not yet freed.
    pub fn outstanding_pages(&self) -> u64 {
        self.state().allocated
    }

    pub fn reserved_pages(&self) -> u64 {
        self.state().reserved
    }

    pub fn live_chunks(&self) -> usize {
        self.state().chunks.len()
    }

    pub fn mapped_chunks(&self) -> usize {
        self.state().chunks.values().filter(|c| c.mapped).count()
    }

    pub fn map_calls(&self) -> u64 {
        self.state().map_calls
    }

    pub fn unmap_calls(&self) -> u64 {
        self.state().unmap_calls
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHUNK_SHIFT)
    }
}

impl HostAllocator for HeapAllocator {
    fn chunk_shift(&self) -> u32 {
        self.chunk_shift
    }

    fn reserve_pages(&self, pages: u64) -> Result<(), HostError> {
        let mut state = self.state();
        state.reserved = state
            .reserved
            .checked_add(pages)
            .ok_or(HostError::ReservationExceeded { requested: pages })?;
        Ok(())
    }

    fn allocate_pages(&self, count: usize) -> Result<Vec<PageBacking>, HostError> {
        let mut state = self.state();
        let total = state.allocated + count as u64;
        if self.page_limit.is_some_and(|limit| total > limit) {
            return Err(HostError::OutOfMemory);
        }

        let chunk_pages = self.chunk_pages();
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let chunk_id = match state
                .chunks
                .iter()
                .find(|(_, chunk)| !chunk.free.is_empty())
                .map(|(id, _)| *id)
            {
                Some(id) => id,
                None => {
                    let id = state.next_chunk;
                    state.next_chunk = id
                        .checked_add(1)
                        .filter(|next| u64::from(*next) << self.chunk_shift <= u64::from(u32::MAX))
                        .ok_or(HostError::OutOfMemory)?;
                    state.chunks.insert(id, HeapChunk::new(chunk_pages));
                    id
                }
            };
            let Some(chunk) = state.chunks.get_mut(&chunk_id) else {
                return Err(HostError::UnknownChunk(chunk_id));
            };
            while out.len() < count {
                let Some(index) = chunk.free.pop() else {
                    break;
                };
                chunk.zero_page(index);
                chunk.in_use[index as usize] = true;
                chunk.used += 1;
                let page_id = PageId((chunk_id << self.chunk_shift) | index);
                out.push(PageBacking {
                    page_id,
                    host_phys: HEAP_HOST_PHYS_BASE + (u64::from(page_id.0) << PAGE_SHIFT),
                });
            }
        }
        state.allocated = total;
        Ok(out)
    }

    fn free_pages(&self, pages: &[PageId]) -> Result<(), HostError> {
        let mut state = self.state();
        for &page in pages {
            let chunk_id = page.chunk(self.chunk_shift).0;
            let index = page.index_in_chunk(self.chunk_shift);
            let chunk = state
                .chunks
                .get_mut(&chunk_id)
                .ok_or(HostError::UnknownPage(page.0))?;
            if !chunk.in_use[index as usize] {
                return Err(HostError::UnknownPage(page.0));
            }
            chunk.in_use[index as usize] = false;
            chunk.free.push(index);
            chunk.used -= 1;
            let release = chunk.used == 0 && !chunk.mapped;
            if release {
                state.chunks.remove(&chunk_id);
            }
            state.allocated -= 1;
        }
        Ok(())
    }

    fn map_chunk(&self, chunk: ChunkId) -> Result<HostPtr, HostError> {
        let mut state = self.state();
        state.map_calls += 1;
        let entry = state
            .chunks
            .get_mut(&chunk.0)
            .ok_or(HostError::UnknownChunk(chunk.0))?;
        entry.mapped = true;
        NonNull::new(entry.data.as_ptr() as *mut u8)
            .map(HostPtr::new)
            .ok_or(HostError::UnknownChunk(chunk.0))
    }

    fn unmap_chunk(&self, chunk: ChunkId) -> Result<(), HostError> {
        let mut state = self.state();
        state.unmap_calls += 1;
        let entry = state
            .chunks
            .get_mut(&chunk.0)
            .ok_or(HostError::UnknownChunk(chunk.0))?;
        entry.mapped = false;
        if entry.used == 0 {
            state.chunks.remove(&chunk.0);
        }
        Ok(())
    }
}
