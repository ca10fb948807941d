//! Direct-mapped guest page to host pointer cache.

use crate::host::HostPtr;
use crate::page::{ChunkId, PageId};
use crate::PAGE_SHIFT;

pub(crate) const PAGE_MAP_TLB_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    page: u64,
    page_id: PageId,
    chunk: ChunkId,
    ptr: HostPtr,
}

#[derive(Debug)]
pub(crate) struct PageMapTlb {
    entries: Box<[Option<TlbEntry>; PAGE_MAP_TLB_ENTRIES]>,
}

impl PageMapTlb {
    pub(crate) fn new() -> Self {
        Self {
            entries: Box::new([None; PAGE_MAP_TLB_ENTRIES]),
        }
    }

    #[inline]
    fn slot(addr: u64) -> usize {
        ((addr >> PAGE_SHIFT) as usize) & (PAGE_MAP_TLB_ENTRIES - 1)
    }

    /// Host pointer of the page at `addr`, provided the cached backing still matches `page_id`.
    pub(crate) fn lookup(&self, addr: u64, page_id: PageId) -> Option<(ChunkId, HostPtr)> {
        let page = addr >> PAGE_SHIFT;
        self.entries[Self::slot(addr)]
            .filter(|e| e.page == page && e.page_id == page_id)
            .map(|e| (e.chunk, e.ptr))
    }

    pub(crate) fn fill(&mut self, addr: u64, page_id: PageId, chunk: ChunkId, ptr: HostPtr) {
        self.entries[Self::slot(addr)] = Some(TlbEntry {
            page: addr >> PAGE_SHIFT,
            page_id,
            chunk,
            ptr,
        });
    }

    pub(crate) fn invalidate(&mut self, addr: u64) {
        let slot = Self::slot(addr);
        if self.entries[slot].is_some_and(|e| e.page == addr >> PAGE_SHIFT) {
            self.entries[slot] = None;
        }
    }

    pub(crate) fn flush(&mut self) {
        self.entries.fill(None);
    }

    pub(crate) fn references_chunk(&self, chunk: ChunkId) -> bool {
        self.entries.iter().flatten().any(|e| e.chunk == chunk)
    }
}
