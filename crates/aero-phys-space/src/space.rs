use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::chunk_cache::ChunkMapCache;
use crate::directory::{Placement, RegionDirectory};
use crate::error::{HostError, PhysError, Result};
use crate::handler::HandlerRegistry;
use crate::host::{ExecutionManager, HostAllocator, HostPtr, PageChange, PageTablePool, RegionEvent};
use crate::mmio2::Mmio2Registration;
use crate::options::PhysSpaceOptions;
use crate::page::{
    ChunkId, HandlerState, PageBacking, PageDescriptor, PageInfo, PageKind, PageState,
};
use crate::region::RegionInfo;
use crate::rendezvous::{ParkingRendezvous, Rendezvous};
use crate::rom::RomOverlay;
use crate::tlb::PageMapTlb;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Why a locked operation stopped before completing.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Fail(PhysError),
    /// The chunk mapping cache is full; the lock must be dropped so an eviction can run inside a
    /// rendezvous, after which the operation is retried.
    Evict,
}

pub(crate) type Flow<T> = std::result::Result<T, Interrupt>;

impl From<PhysError> for Interrupt {
    fn from(err: PhysError) -> Self {
        Interrupt::Fail(err)
    }
}

impl From<HostError> for Interrupt {
    fn from(err: HostError) -> Self {
        Interrupt::Fail(err.into())
    }
}

/// Host memory bookkeeping: chunk mappings, the page-map TLB and the handy page reserve.
#[derive(Debug)]
pub(crate) struct MemState {
    pub(crate) chunks: ChunkMapCache,
    pub(crate) tlb: PageMapTlb,
    pub(crate) handy: Vec<PageBacking>,
    pub(crate) read_locked_pages: u64,
    pub(crate) write_locked_pages: u64,
}

#[derive(Debug)]
pub(crate) struct SpaceState {
    pub(crate) dir: RegionDirectory,
    pub(crate) handlers: HandlerRegistry,
    /// Sorted by base address, never overlapping.
    pub(crate) roms: Vec<RomOverlay>,
    /// Keyed by the first chunk id of each registration.
    pub(crate) mmio2: BTreeMap<u32, Mmio2Registration>,
    pub(crate) next_mmio2_id: u32,
    pub(crate) restore_rom_on_reset: bool,
    pub(crate) mem: MemState,
}

/// Counters describing the current state of an address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysStats {
    pub regions: usize,
    /// Pages across all linked regions.
    pub total_pages: u64,
    pub zero_pages: u64,
    pub allocated_pages: u64,
    pub write_monitored_pages: u64,
    pub shared_pages: u64,
    pub ballooned_pages: u64,
    pub mmio_pages: u64,
    pub read_locked_pages: u64,
    pub write_locked_pages: u64,
    pub mapped_chunks: usize,
    pub evicted_chunks: u64,
    pub handy_pages: usize,
    pub rom_overlays: usize,
    pub mmio2_registrations: usize,
}

/// The guest-physical address space of one VM.
///
/// All mutation happens under one internal lock. The directory generation counter
/// ([`PhysAddressSpace::generation`]) can be read without it.
pub struct PhysAddressSpace {
    pub(crate) options: PhysSpaceOptions,
    pub(crate) allocator: Arc<dyn HostAllocator>,
    pub(crate) chunk_shift: u32,
    pub(crate) exec: Option<Arc<dyn ExecutionManager>>,
    pool: Option<Arc<dyn PageTablePool>>,
    rendezvous: Arc<dyn Rendezvous>,
    state: Mutex<SpaceState>,
    generation: Arc<AtomicU64>,
    quiesced: AtomicBool,
    pub(crate) low_memory: AtomicBool,
    pub(crate) handy_refill_pending: AtomicBool,
    zero_page: Box<[AtomicU8]>,
}

impl PhysAddressSpace {
    pub fn new(allocator: Arc<dyn HostAllocator>, options: PhysSpaceOptions) -> Result<Self> {
        options.validate()?;
        let chunk_shift = allocator.chunk_shift();
        if chunk_shift >= 32 {
            return Err(PhysError::InvalidConfig("allocator chunk shift out of range"));
        }
        let generation = Arc::new(AtomicU64::new(0));
        let state = SpaceState {
            dir: RegionDirectory::new(Arc::clone(&generation)),
            handlers: HandlerRegistry::default(),
            roms: Vec::new(),
            mmio2: BTreeMap::new(),
            next_mmio2_id: 1,
            restore_rom_on_reset: false,
            mem: MemState {
                chunks: ChunkMapCache::new(options.max_mapped_chunks),
                tlb: PageMapTlb::new(),
                handy: Vec::with_capacity(options.handy_pages),
                read_locked_pages: 0,
                write_locked_pages: 0,
            },
        };
        Ok(Self {
            options,
            allocator,
            chunk_shift,
            exec: None,
            pool: None,
            rendezvous: Arc::new(ParkingRendezvous::new()),
            state: Mutex::new(state),
            generation,
            quiesced: AtomicBool::new(false),
            low_memory: AtomicBool::new(false),
            handy_refill_pending: AtomicBool::new(true),
            zero_page: (0..PAGE_SIZE).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    pub fn with_execution_manager(mut self, exec: Arc<dyn ExecutionManager>) -> Self {
        self.exec = Some(exec);
        self
    }

    pub fn with_page_table_pool(mut self, pool: Arc<dyn PageTablePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_rendezvous(mut self, rendezvous: Arc<dyn Rendezvous>) -> Self {
        self.rendezvous = rendezvous;
        self
    }

    pub fn options(&self) -> &PhysSpaceOptions {
        &self.options
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` under the address-space lock, performing evictions it asks for in between
    /// attempts. `op` must be safe to re-run from the start after an [`Interrupt::Evict`].
    pub(crate) fn locked<T>(&self, mut op: impl FnMut(&mut SpaceState) -> Flow<T>) -> Result<T> {
        loop {
            let outcome = {
                let mut state = self.lock_state();
                op(&mut state)
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(Interrupt::Fail(err)) => return Err(err),
                Err(Interrupt::Evict) => self.evict_one()?,
            }
        }
    }

    /// Current directory generation. Changes whenever regions or their page descriptors are
    /// restructured; readable without taking the lock.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Declares that no other execution thread is running (e.g. during state load), allowing
    /// chunk evictions to happen without a rendezvous.
    pub fn set_quiesced(&self, quiesced: bool) {
        self.quiesced.store(quiesced, Ordering::Release);
    }

    pub fn is_low_on_memory(&self) -> bool {
        self.low_memory.load(Ordering::Acquire)
    }

    /// Whether the handy page reserve dropped below its refill threshold.
    pub fn handy_refill_pending(&self) -> bool {
        self.handy_refill_pending.load(Ordering::Acquire)
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.lock_state().dir.iter().map(|r| r.info()).collect()
    }

    pub fn lookup_region(&self, addr: u64) -> Option<RegionInfo> {
        self.lock_state().dir.lookup(addr).map(|r| r.info())
    }

    pub fn page_info(&self, addr: u64) -> Option<PageInfo> {
        self.lock_state().dir.page(addr).map(PageDescriptor::info)
    }

    pub fn stats(&self) -> PhysStats {
        let state = self.lock_state();
        let mut stats = PhysStats {
            regions: state.dir.len(),
            read_locked_pages: state.mem.read_locked_pages,
            write_locked_pages: state.mem.write_locked_pages,
            mapped_chunks: state.mem.chunks.len(),
            evicted_chunks: state.mem.chunks.evictions(),
            handy_pages: state.mem.handy.len(),
            rom_overlays: state.roms.len(),
            mmio2_registrations: state.mmio2.len(),
            ..PhysStats::default()
        };
        for page in state.dir.iter().flat_map(|r| r.pages()) {
            stats.total_pages += 1;
            if page.kind().is_mmio() {
                stats.mmio_pages += 1;
            }
            match page.state() {
                PageState::Zero => stats.zero_pages += 1,
                PageState::Allocated => stats.allocated_pages += 1,
                PageState::WriteMonitored => stats.write_monitored_pages += 1,
                PageState::Shared => stats.shared_pages += 1,
                PageState::Ballooned => stats.ballooned_pages += 1,
            }
        }
        stats
    }

    // --- Collaborator plumbing -------------------------------------------------------------

    pub(crate) fn notify_page_changed(&self, change: PageChange) -> Result<()> {
        let Some(exec) = &self.exec else {
            return Ok(());
        };
        match exec.notify_page_changed(&change) {
            Ok(()) => Ok(()),
            Err(err) if self.options.execution_manager_mandatory => {
                Err(PhysError::ExecutionManager(err))
            }
            Err(err) => {
                warn!(addr = change.addr, error = %err, "execution manager page update failed");
                Ok(())
            }
        }
    }

    pub(crate) fn notify_region(&self, mapped: bool, event: RegionEvent) -> Result<()> {
        let Some(exec) = &self.exec else {
            return Ok(());
        };
        let outcome = if mapped {
            exec.notify_region_mapped(&event)
        } else {
            exec.notify_region_unmapped(&event)
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if self.options.execution_manager_mandatory => {
                Err(PhysError::ExecutionManager(err))
            }
            Err(err) => {
                warn!(
                    base = event.base,
                    size = event.size,
                    mapped,
                    error = %err,
                    "execution manager region notification failed"
                );
                Ok(())
            }
        }
    }

    pub(crate) fn page_change(
        addr: u64,
        old: Option<PageBacking>,
        page: &PageDescriptor,
        ptr: Option<HostPtr>,
    ) -> PageChange {
        PageChange {
            addr,
            kind: page.kind(),
            old_host_phys: old.map(|b| b.host_phys),
            new_host_phys: page.backing().map(|b| b.host_phys),
            new_host_ptr: ptr,
            protection: page.protection(),
        }
    }

    pub(crate) fn pool_invalidate(&self, addr: u64) {
        if let Some(pool) = &self.pool {
            pool.invalidate_page(addr);
        }
    }

    pub(crate) fn pool_clear(&self) {
        if let Some(pool) = &self.pool {
            pool.clear_all();
        }
    }

    // --- Chunk mappings --------------------------------------------------------------------

    /// Maps `chunk` and takes a reference on it. Pair with [`Self::release_chunk`].
    pub fn acquire_chunk(&self, chunk: ChunkId) -> Result<HostPtr> {
        self.locked(|state| {
            let ptr = self.chunk_ptr(&mut state.mem, chunk)?;
            state.mem.chunks.add_ref(chunk);
            Ok(ptr)
        })
    }

    pub fn release_chunk(&self, chunk: ChunkId) {
        let mut state = self.lock_state();
        if !state.mem.chunks.release(chunk) {
            warn!(chunk = chunk.0, "released a chunk that holds no references");
        }
    }

    pub fn is_chunk_mapped(&self, chunk: ChunkId) -> bool {
        self.lock_state().mem.chunks.contains(chunk)
    }

    pub fn mapped_chunk_count(&self) -> usize {
        self.lock_state().mem.chunks.len()
    }

    /// `(references, permanent references)` of a mapped chunk.
    pub fn chunk_refs(&self, chunk: ChunkId) -> Option<(u32, u32)> {
        self.lock_state().mem.chunks.refs(chunk)
    }

    pub(crate) fn chunk_ptr(&self, mem: &mut MemState, chunk: ChunkId) -> Flow<HostPtr> {
        if let Some(ptr) = mem.chunks.touch(chunk) {
            return Ok(ptr);
        }
        if mem.chunks.is_full() {
            let victim = self.pick_victim(mem)?;
            if !self.quiesced.load(Ordering::Acquire) {
                return Err(Interrupt::Evict);
            }
            self.unmap_chunk_locked(mem, victim)?;
        }
        let ptr = self.allocator.map_chunk(chunk)?;
        mem.chunks.insert(chunk, ptr);
        Ok(ptr)
    }

    fn pick_victim(&self, mem: &mut MemState) -> Result<ChunkId> {
        if let Some(victim) = mem
            .chunks
            .find_eviction_candidate(|id| mem.tlb.references_chunk(id))
        {
            return Ok(victim);
        }
        // Everything unpinned is only held by the page-map TLB, which is ours to drop.
        if mem.chunks.has_unpinned() {
            mem.tlb.flush();
            if let Some(victim) = mem.chunks.find_eviction_candidate(|_| false) {
                return Ok(victim);
            }
        }
        Err(PhysError::NoEvictableChunk {
            mapped: mem.chunks.len(),
        })
    }

    fn unmap_chunk_locked(&self, mem: &mut MemState, chunk: ChunkId) -> Result<()> {
        self.pool_clear();
        self.allocator.unmap_chunk(chunk)?;
        mem.chunks.remove(chunk);
        mem.tlb.flush();
        debug!(chunk = chunk.0, mapped = mem.chunks.len(), "evicted chunk mapping");
        Ok(())
    }

    fn evict_one(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.rendezvous.run_exclusive(&mut || {
            let mut state = self.lock_state();
            if !state.mem.chunks.is_full() {
                return;
            }
            outcome = self
                .pick_victim(&mut state.mem)
                .and_then(|victim| self.unmap_chunk_locked(&mut state.mem, victim));
        });
        outcome
    }

    pub(crate) fn zero_page_ptr(&self) -> HostPtr {
        // The zero page is never written through this pointer.
        HostPtr::new(std::ptr::NonNull::from(&self.zero_page[0]).cast())
    }

    /// Host address of a backing page; `addr` enables the page-map TLB.
    pub(crate) fn backing_ptr(
        &self,
        mem: &mut MemState,
        addr: Option<u64>,
        backing: PageBacking,
    ) -> Flow<HostPtr> {
        if let Some(addr) = addr {
            if let Some((chunk, ptr)) = mem.tlb.lookup(addr, backing.page_id) {
                mem.chunks.touch(chunk);
                return Ok(ptr);
            }
        }
        let chunk = backing.page_id.chunk(self.chunk_shift);
        let base = self.chunk_ptr(mem, chunk)?;
        let index = backing.page_id.index_in_chunk(self.chunk_shift) as usize;
        let ptr = base.offset(index << PAGE_SHIFT);
        if let Some(addr) = addr {
            mem.tlb.fill(addr, backing.page_id, chunk, ptr);
        }
        Ok(ptr)
    }

    /// Host address of the page contents; pages without backing resolve to the zero page.
    pub(crate) fn page_ptr(
        &self,
        mem: &mut MemState,
        page: &PageDescriptor,
        addr: u64,
    ) -> Flow<HostPtr> {
        match page.backing() {
            Some(backing) => self.backing_ptr(mem, Some(addr), backing),
            None => Ok(self.zero_page_ptr()),
        }
    }
}

impl SpaceState {
    /// Sets the handler state of every linked page in `base..=last`.
    pub(crate) fn set_page_handlers(&mut self, base: u64, last: u64, handler: HandlerState) {
        for addr in (base..=last).step_by(PAGE_SIZE as usize) {
            if let Some(page) = self.dir.page_mut(addr) {
                page.set_handler(handler);
            }
            self.mem.tlb.invalidate(addr);
        }
        self.dir.bump();
    }

    pub(crate) fn conflict(&self, base: u64, last: u64, placement: &Placement) -> PhysError {
        let (existing_base, existing_last, existing_tag) = match placement {
            Placement::Conflict { base, last, tag } => (*base, *last, tag.clone()),
            Placement::Contained(region) => match self.dir.get(*region) {
                Some(r) => (r.base(), r.last(), r.tag().to_string()),
                None => (*region, *region, String::new()),
            },
            Placement::Free => (base, last, String::new()),
        };
        PhysError::Conflict {
            base,
            last,
            existing_base,
            existing_last,
            existing_tag,
        }
    }
}

/// Validates a page-aligned, non-empty range and returns its last byte.
pub(crate) fn check_range(base: u64, size: u64) -> Result<u64> {
    if base & (PAGE_SIZE - 1) != 0 {
        return Err(PhysError::Unaligned { value: base });
    }
    if size & (PAGE_SIZE - 1) != 0 {
        return Err(PhysError::Unaligned { value: size });
    }
    if size == 0 {
        return Err(PhysError::InvalidRange { base, size });
    }
    base.checked_add(size - 1)
        .ok_or(PhysError::InvalidRange { base, size })
}

/// Descriptor indices of the first and last page of `base..=last` in a region at `region_base`.
pub(crate) fn page_span(region_base: u64, base: u64, last: u64) -> (usize, usize) {
    (
        ((base - region_base) >> PAGE_SHIFT) as usize,
        ((last - region_base) >> PAGE_SHIFT) as usize,
    )
}

pub(crate) fn region_event(base: u64, size: u64, kind: PageKind, tag: &str) -> RegionEvent {
    RegionEvent {
        base,
        size,
        kind,
        tag: tag.to_string(),
    }
}

/// Copies guest memory out of a host mapping.
///
/// # Safety
///
/// `src..src + dst.len()` must lie inside a live chunk mapping or the zero page.
pub(crate) unsafe fn copy_from_host(src: HostPtr, dst: &mut [u8]) {
    let bytes = std::slice::from_raw_parts(src.as_ptr() as *const AtomicU8, dst.len());
    for (d, s) in dst.iter_mut().zip(bytes) {
        *d = s.load(Ordering::Relaxed);
    }
}

/// Copies bytes into a host mapping.
///
/// # Safety
///
/// `dst..dst + src.len()` must lie inside a live chunk mapping.
pub(crate) unsafe fn copy_to_host(dst: HostPtr, src: &[u8]) {
    let bytes = std::slice::from_raw_parts(dst.as_ptr() as *const AtomicU8, src.len());
    for (d, s) in bytes.iter().zip(src) {
        d.store(*s, Ordering::Relaxed);
    }
}
