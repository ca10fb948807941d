//! Page backing allocation and release.
//!
//! Freed backing ids are queued in a [`FreeBatch`] and handed to the host allocator in bounded
//! batches. First-touch allocation draws from the handy page reserve so a fault never has to wait
//! for the allocator unless the reserve is empty.

use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::error::{HostError, PhysError, Result};
use crate::host::{HostAllocator, HostPtr, PageChange};
use crate::page::{PageBacking, PageDescriptor, PageId, PageKind, PageState};
use crate::space::{copy_from_host, copy_to_host, Flow, MemState, PhysAddressSpace, SpaceState};
use crate::PAGE_SIZE;

/// Backing ids waiting to be returned to the host allocator.
///
/// Ids still queued when the batch is dropped without [`FreeBatch::finish`] (an error unwound
/// past it) are flushed on drop so they are not leaked.
pub(crate) struct FreeBatch<'a> {
    allocator: &'a dyn HostAllocator,
    pending: Vec<PageId>,
    limit: usize,
    freed: u64,
}

impl<'a> FreeBatch<'a> {
    pub(crate) fn new(space: &'a PhysAddressSpace) -> Self {
        Self {
            allocator: space.allocator.as_ref(),
            pending: Vec::with_capacity(space.options.free_batch_size),
            limit: space.options.free_batch_size,
            freed: 0,
        }
    }

    pub(crate) fn push(&mut self, page: PageId) -> Result<()> {
        self.pending.push(page);
        if self.pending.len() >= self.limit {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let count = self.pending.len();
        let result = self.allocator.free_pages(&self.pending);
        self.pending.clear();
        result?;
        self.freed += count as u64;
        trace!(count, "returned pages to host allocator");
        Ok(())
    }

    /// Flushes the remaining ids and returns how many pages were freed in total.
    pub(crate) fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.freed)
    }
}

impl Drop for FreeBatch<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to return pages to host allocator");
        }
    }
}

/// Descriptors an overlay took out of a region.
///
/// Their backing is returned to the host only through [`PhysAddressSpace::release_displaced`],
/// once the overlay has been announced; until then [`SpaceState::restore`] can put them back.
#[derive(Debug)]
pub(crate) struct Displaced {
    region_base: u64,
    first: usize,
    pages: Vec<PageDescriptor>,
}

impl SpaceState {
    /// Fails if any linked page in `base..=last` holds a mapping lock.
    pub(crate) fn check_unlocked(&self, base: u64, last: u64) -> Result<()> {
        for addr in (base..=last).step_by(PAGE_SIZE as usize) {
            if self.dir.page(addr).is_some_and(PageDescriptor::is_locked) {
                return Err(PhysError::WrongState("page is locked"));
            }
        }
        Ok(())
    }

    fn check_ram_unlocked(&self) -> Result<()> {
        let locked = self
            .dir
            .iter()
            .flat_map(|r| r.pages())
            .any(|p| p.kind() == PageKind::Ram && p.is_locked());
        if locked {
            return Err(PhysError::WrongState("page is locked"));
        }
        Ok(())
    }

    /// Replaces the descriptors starting at index `first` of the region at `region_base` with
    /// `replacements` and returns the previous ones.
    pub(crate) fn displace(
        &mut self,
        region_base: u64,
        first: usize,
        replacements: Vec<PageDescriptor>,
    ) -> Result<Displaced> {
        let SpaceState { dir, mem, .. } = self;
        let region = dir
            .get_mut(region_base)
            .ok_or(PhysError::NotMapped { addr: region_base })?;
        if first + replacements.len() > region.page_count() {
            return Err(PhysError::InvalidParameter("displaced range leaves the region"));
        }
        let mut pages = Vec::with_capacity(replacements.len());
        for (i, new) in replacements.into_iter().enumerate() {
            let idx = first + i;
            debug_assert!(!region.pages()[idx].is_locked());
            mem.tlb.invalidate(region.page_addr(idx));
            pages.push(std::mem::replace(&mut region.pages_mut()[idx], new));
        }
        dir.bump();
        Ok(Displaced {
            region_base,
            first,
            pages,
        })
    }

    /// Page changes from the displaced descriptors to the ones now linked in their place.
    pub(crate) fn displacement_changes(&self, displaced: &Displaced) -> Vec<PageChange> {
        let Some(region) = self.dir.get(displaced.region_base) else {
            return Vec::new();
        };
        displaced
            .pages
            .iter()
            .enumerate()
            .map(|(i, old)| {
                let idx = displaced.first + i;
                PhysAddressSpace::page_change(
                    region.page_addr(idx),
                    old.backing(),
                    &region.pages()[idx],
                    None,
                )
            })
            .collect()
    }

    /// Puts displaced descriptors back and returns the changes that undid. Whatever replaced
    /// them is dropped without freeing; its backing belongs to the caller.
    pub(crate) fn restore(&mut self, displaced: Displaced) -> Vec<PageChange> {
        let SpaceState { dir, mem, .. } = self;
        let Some(region) = dir.get_mut(displaced.region_base) else {
            return Vec::new();
        };
        let mut changes = Vec::with_capacity(displaced.pages.len());
        for (i, old) in displaced.pages.into_iter().enumerate() {
            let idx = displaced.first + i;
            let addr = region.page_addr(idx);
            let replaced = std::mem::replace(&mut region.pages_mut()[idx], old);
            mem.tlb.invalidate(addr);
            changes.push(PhysAddressSpace::page_change(
                addr,
                replaced.backing(),
                &region.pages()[idx],
                None,
            ));
        }
        dir.bump();
        changes
    }
}

impl PhysAddressSpace {
    /// Drops a page's backing into `batch`. Pages without backing are left alone.
    ///
    /// `addr` is the guest-physical address when the descriptor is live in the directory; the
    /// page-map TLB and execution manager are only told about live pages.
    pub(crate) fn free_page(
        &self,
        mem: &mut MemState,
        batch: &mut FreeBatch<'_>,
        page: &mut PageDescriptor,
        addr: Option<u64>,
    ) -> Result<()> {
        if !page.state().has_backing() {
            return Ok(());
        }
        if page.state() == PageState::WriteMonitored {
            page.mark_written_to();
        }
        let old = page.set_zero();
        if let Some(old) = old {
            batch.push(old.page_id)?;
        }
        if let Some(addr) = addr {
            mem.tlb.invalidate(addr);
            self.notify_page_changed(Self::page_change(addr, old, page, None))?;
        }
        Ok(())
    }

    /// Hands the backing of displaced descriptors back to the host allocator.
    pub(crate) fn release_displaced(&self, displaced: Displaced) -> Result<u64> {
        let mut batch = FreeBatch::new(self);
        for page in &displaced.pages {
            if let Some(id) = page.page_id() {
                batch.push(id)?;
            }
        }
        let freed = batch.finish()?;
        debug!(
            base = displaced.region_base,
            first = displaced.first,
            pages = displaced.pages.len(),
            freed,
            "released displaced pages"
        );
        Ok(freed)
    }

    /// Tells the execution manager about `changes`. The first refusal stops the walk.
    pub(crate) fn announce_pages(&self, changes: &[PageChange]) -> Result<()> {
        for change in changes {
            self.notify_page_changed(*change)?;
        }
        Ok(())
    }

    /// Reports changes made while undoing a refused operation. Failures are only logged.
    pub(crate) fn announce_pages_lenient(&self, changes: &[PageChange]) {
        let Some(exec) = &self.exec else {
            return;
        };
        for change in changes {
            if let Err(err) = exec.notify_page_changed(change) {
                warn!(
                    addr = change.addr,
                    error = %err,
                    "execution manager rollback update failed"
                );
            }
        }
    }

    // --- Handy pages -----------------------------------------------------------------------

    fn refill_handy_locked(&self, mem: &mut MemState) -> Result<usize> {
        let want = self.options.handy_pages.saturating_sub(mem.handy.len());
        if want == 0 {
            return Ok(mem.handy.len());
        }
        match self.allocator.allocate_pages(want) {
            Ok(pages) => {
                mem.handy.extend(pages);
                self.low_memory.store(false, Ordering::Release);
                self.handy_refill_pending.store(false, Ordering::Release);
                trace!(count = want, "refilled handy pages");
                Ok(mem.handy.len())
            }
            Err(err) => {
                if !self.low_memory.swap(true, Ordering::AcqRel) {
                    warn!(
                        error = %err,
                        wanted = want,
                        "handy page refill failed; host is low on memory"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Tops up the handy page reserve and returns how many pages it now holds.
    ///
    /// Allocator exhaustion is not reported to the caller; it sets the low-memory flag instead
    /// (see [`PhysAddressSpace::is_low_on_memory`]).
    pub fn refill_handy_pages(&self) -> usize {
        let mut state = self.lock_state();
        let _ = self.refill_handy_locked(&mut state.mem);
        state.mem.handy.len()
    }

    fn take_handy_page(&self, mem: &mut MemState) -> Result<PageBacking> {
        if self.options.handy_pages == 0 {
            let mut pages = self.allocator.allocate_pages(1)?;
            return pages
                .pop()
                .ok_or(PhysError::ResourceExhausted(HostError::OutOfMemory));
        }
        if mem.handy.is_empty() {
            self.refill_handy_locked(mem)?;
        }
        let page = mem
            .handy
            .pop()
            .ok_or(PhysError::ResourceExhausted(HostError::OutOfMemory))?;
        if mem.handy.len() <= self.options.handy_refill_threshold {
            self.handy_refill_pending.store(true, Ordering::Release);
        }
        Ok(page)
    }

    /// Gives `page` private, writable backing.
    ///
    /// Zero and ballooned pages get a fresh handy page, shared pages get a private copy and
    /// write-monitored pages simply become allocated again.
    pub(crate) fn make_writable(
        &self,
        mem: &mut MemState,
        page: &mut PageDescriptor,
        addr: Option<u64>,
    ) -> Flow<()> {
        match page.state() {
            PageState::Allocated => Ok(()),
            PageState::WriteMonitored => {
                page.set_backed_state(PageState::Allocated);
                page.mark_written_to();
                if let Some(addr) = addr {
                    mem.tlb.invalidate(addr);
                    self.notify_page_changed(Self::page_change(addr, page.backing(), page, None))?;
                }
                Ok(())
            }
            PageState::Zero | PageState::Ballooned | PageState::Shared => {
                let shared = page.backing().filter(|_| page.state() == PageState::Shared);
                let source = match shared {
                    Some(backing) => {
                        let ptr = self.backing_ptr(mem, None, backing)?;
                        let chunk = backing.page_id.chunk(self.chunk_shift);
                        mem.chunks.add_ref(chunk);
                        Some((ptr, chunk))
                    }
                    None => None,
                };
                let copy_from = source.map(|(ptr, _)| ptr);
                let outcome = self.install_private_page(mem, page, addr, copy_from);
                if let Some((_, chunk)) = source {
                    mem.chunks.release(chunk);
                }
                let old = outcome?;
                if let Some(old) = old.filter(|_| shared.is_some()) {
                    // The sharing collaborator handed us one reference to the shared page.
                    self.allocator.free_pages(&[old.page_id])?;
                }
                Ok(())
            }
        }
    }

    fn install_private_page(
        &self,
        mem: &mut MemState,
        page: &mut PageDescriptor,
        addr: Option<u64>,
        copy_from: Option<HostPtr>,
    ) -> Flow<Option<PageBacking>> {
        let new = self.take_handy_page(mem)?;
        let dst = match self.backing_ptr(mem, addr, new) {
            Ok(ptr) => ptr,
            Err(err) => {
                mem.handy.push(new);
                return Err(err);
            }
        };
        if let Some(src) = copy_from {
            let mut buf = [0u8; PAGE_SIZE as usize];
            // SAFETY: both pointers address whole pages inside chunks that are mapped; the source
            // chunk carries a temporary reference and the lock is held for the copy.
            unsafe {
                copy_from_host(src, &mut buf);
                copy_to_host(dst, &buf);
            }
        }
        let old = page.install(PageState::Allocated, new);
        if let Some(addr) = addr {
            self.notify_page_changed(Self::page_change(addr, old, page, Some(dst)))?;
        }
        trace!(addr = ?addr, page_id = new.page_id.0, "allocated page");
        Ok(old)
    }

    // --- Balloon, write monitoring, sharing ------------------------------------------------

    /// Inflates (frees into the Ballooned state) or deflates (returns to Zero) RAM pages.
    pub fn change_memory_balloon(&self, inflate: bool, pages: &[u64]) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        for &addr in pages {
            let page = state
                .dir
                .page(addr)
                .ok_or(PhysError::NotMapped { addr })?;
            if page.kind() != PageKind::Ram {
                return Err(PhysError::WrongPageKind {
                    addr,
                    kind: page.kind(),
                });
            }
            if page.is_locked() {
                return Err(PhysError::WrongState("page is locked"));
            }
        }

        let SpaceState { dir, mem, .. } = state;
        let mut batch = FreeBatch::new(self);
        for &addr in pages {
            let addr = addr & !(PAGE_SIZE - 1);
            let Some(page) = dir.page_mut(addr) else {
                continue;
            };
            if inflate {
                self.free_page(mem, &mut batch, page, Some(addr))?;
                page.set_ballooned();
            } else if page.state() == PageState::Ballooned {
                page.set_zero();
            }
        }
        batch.finish()?;
        dir.bump();
        self.pool_clear();
        debug!(inflate, count = pages.len(), "changed memory balloon");
        Ok(())
    }

    /// Arms write monitoring on every allocated RAM page.
    pub fn write_protect_ram(&self) -> u64 {
        let mut state = self.lock_state();
        let mut count = 0;
        for region in state.dir.iter_mut() {
            for page in region.pages_mut() {
                if page.kind() == PageKind::Ram && page.state() == PageState::Allocated {
                    page.set_backed_state(PageState::WriteMonitored);
                    count += 1;
                }
            }
        }
        state.dir.bump();
        state.mem.tlb.flush();
        drop(state);
        self.pool_clear();
        debug!(count, "write protected RAM");
        count
    }

    /// Replaces the backing of the RAM page at `addr` with a shared page.
    ///
    /// The address space takes over the caller's reference to `shared`; it is released when the
    /// page is written (copy-on-write) or freed.
    pub fn install_shared_page(&self, addr: u64, shared: PageBacking) -> Result<()> {
        let mut guard = self.lock_state();
        let SpaceState { dir, mem, .. } = &mut *guard;
        let addr = addr & !(PAGE_SIZE - 1);
        let page = dir.page_mut(addr).ok_or(PhysError::NotMapped { addr })?;
        if page.kind() != PageKind::Ram {
            return Err(PhysError::WrongPageKind {
                addr,
                kind: page.kind(),
            });
        }
        if page.is_locked() {
            return Err(PhysError::WrongState("page is locked"));
        }
        let mut batch = FreeBatch::new(self);
        self.free_page(mem, &mut batch, page, Some(addr))?;
        page.install(PageState::Shared, shared);
        self.notify_page_changed(Self::page_change(addr, None, page, None))?;
        batch.finish()?;
        dir.bump();
        Ok(())
    }

    // --- Whole-space operations ------------------------------------------------------------

    /// Returns all RAM to its power-on state.
    ///
    /// Private and shared RAM pages are freed. With `preallocate_ram` the backing is kept and
    /// zeroed instead. Fails without changing anything while a RAM page is locked.
    pub fn reset_ram(&self) -> Result<()> {
        if self.options.preallocate_ram {
            return self.locked(|state| {
                state.check_ram_unlocked()?;
                let SpaceState { dir, mem, .. } = state;
                for region in dir.iter_mut() {
                    for idx in 0..region.page_count() {
                        let addr = region.page_addr(idx);
                        let page = &mut region.pages_mut()[idx];
                        if page.kind() != PageKind::Ram {
                            continue;
                        }
                        if page.state() == PageState::Ballooned || page.state() == PageState::Zero
                        {
                            continue;
                        }
                        self.make_writable(mem, page, Some(addr))?;
                        let ptr = self.page_ptr(mem, page, addr)?;
                        // SAFETY: `ptr` addresses a whole page in a mapped chunk; the lock is held.
                        unsafe { copy_to_host(ptr, &[0u8; PAGE_SIZE as usize]) };
                    }
                }
                Ok(())
            });
        }

        let mut guard = self.lock_state();
        guard.check_ram_unlocked()?;
        let SpaceState { dir, mem, .. } = &mut *guard;
        let mut batch = FreeBatch::new(self);
        let mut freed_pages = 0u64;
        for region in dir.iter_mut() {
            for idx in 0..region.page_count() {
                let addr = region.page_addr(idx);
                let page = &mut region.pages_mut()[idx];
                if page.kind() != PageKind::Ram {
                    continue;
                }
                if page.state().has_backing() {
                    freed_pages += 1;
                }
                self.free_page(mem, &mut batch, page, Some(addr))?;
                if page.state() == PageState::Ballooned {
                    page.set_zero();
                }
            }
        }
        batch.finish()?;
        dir.bump();
        mem.tlb.flush();
        drop(guard);
        self.pool_clear();
        debug!(freed_pages, "reset RAM");
        Ok(())
    }

    /// Returns every page, handy page and chunk mapping to the host allocator and empties the
    /// address space.
    pub fn terminate(&mut self) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let mut batch = FreeBatch::new(self);
        let mut freed = 0u64;

        let bases: Vec<u64> = state.dir.iter().map(|r| r.base()).collect();
        for base in bases {
            let Some(mut region) = state.dir.remove(base) else {
                continue;
            };
            for page in region.pages_mut() {
                // MMIO2 backing is owned by its registration.
                if page.kind() == PageKind::Mmio2 {
                    continue;
                }
                if let Some(old) = page.set_zero() {
                    batch.push(old.page_id)?;
                    freed += 1;
                }
            }
        }
        for overlay in state.roms.drain(..) {
            for rom_page in overlay.pages {
                if let Some(old) = rom_page.stored.and_then(|mut p| p.set_zero()) {
                    batch.push(old.page_id)?;
                    freed += 1;
                }
            }
        }
        for (_, reg) in std::mem::take(&mut state.mmio2) {
            for page in reg.backing_ids() {
                batch.push(page)?;
                freed += 1;
            }
        }
        for handy in state.mem.handy.drain(..) {
            batch.push(handy.page_id)?;
        }
        batch.finish()?;

        state.handlers = Default::default();
        state.mem.tlb.flush();
        self.pool_clear();
        for chunk in state.mem.chunks.drain() {
            self.allocator.unmap_chunk(chunk)?;
        }
        state.dir.bump();
        debug!(freed, "terminated address space");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HeapAllocator;
    use crate::options::PhysSpaceOptions;
    use std::sync::Arc;

    #[test]
    fn free_batch_flushes_at_limit_and_on_finish() {
        let alloc = Arc::new(HeapAllocator::new(4));
        let options = PhysSpaceOptions {
            free_batch_size: 4,
            ..PhysSpaceOptions::default()
        };
        let space = PhysAddressSpace::new(alloc.clone(), options).unwrap();
        let pages = alloc.allocate_pages(6).unwrap();

        let mut batch = FreeBatch::new(&space);
        for page in &pages[..4] {
            batch.push(page.page_id).unwrap();
        }
        assert_eq!(alloc.outstanding_pages(), 2);
        batch.push(pages[4].page_id).unwrap();
        batch.push(pages[5].page_id).unwrap();
        assert_eq!(batch.finish().unwrap(), 6);
        assert_eq!(alloc.outstanding_pages(), 0);
    }

    #[test]
    fn dropped_batch_still_returns_pages() {
        let alloc = Arc::new(HeapAllocator::new(4));
        let space = PhysAddressSpace::new(alloc.clone(), PhysSpaceOptions::default()).unwrap();
        let pages = alloc.allocate_pages(2).unwrap();
        {
            let mut batch = FreeBatch::new(&space);
            batch.push(pages[0].page_id).unwrap();
            batch.push(pages[1].page_id).unwrap();
        }
        assert_eq!(alloc.outstanding_pages(), 0);
    }

    #[test]
    fn handy_reserve_falls_back_to_low_memory_flag() {
        let alloc = Arc::new(HeapAllocator::with_page_limit(4, 2));
        let options = PhysSpaceOptions {
            handy_pages: 4,
            handy_refill_threshold: 1,
            ..PhysSpaceOptions::default()
        };
        let space = PhysAddressSpace::new(alloc, options).unwrap();
        assert_eq!(space.refill_handy_pages(), 0);
        assert!(space.is_low_on_memory());
    }
}
