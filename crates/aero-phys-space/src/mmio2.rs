//! Device-owned RAM (MMIO2).
//!
//! A registration is split into chunk regions of at most `max_mmio2_chunk_pages` pages. While
//! unmapped the chunks float outside the directory. Mapping either links the chunks one after
//! another into free guest-physical space or, for a range inside a RAM region, points the RAM
//! pages at the MMIO2 backing. Backing ids never change between registration and
//! deregistration, so content survives remapping.

use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;

use crate::alloc::FreeBatch;
use crate::directory::Placement;
use crate::error::{PhysError, Result};
use crate::handler::{HandlerKind, PhysHandler};
use crate::host::HostPtr;
use crate::page::{HandlerState, PageBacking, PageDescriptor, PageId, PageKind};
use crate::region::{Region, RegionFlags};
use crate::space::{
    check_range, copy_from_host, copy_to_host, page_span, region_event, PhysAddressSpace,
    SpaceState,
};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Handle of an MMIO2 registration: the id of its first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mmio2Handle(u32);

impl Mmio2Handle {
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Device instance owning a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Mmio2Flags: u32 {
        /// Guest writes are recorded in a per-page dirty bitmap.
        const TRACK_DIRTY_PAGES = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mmio2Info {
    pub handle: Mmio2Handle,
    pub owner: DeviceId,
    pub sub_device: u32,
    pub region_index: u32,
    pub size: u64,
    pub chunk_count: usize,
    pub mapped_at: Option<u64>,
    pub overlapping: bool,
}

#[derive(Debug)]
pub(crate) struct Mmio2Chunk {
    pages: usize,
    /// The chunk's region while it is not linked into the directory.
    floating: Option<Region>,
}

#[derive(Debug)]
pub(crate) struct Mmio2Registration {
    handle: Mmio2Handle,
    owner: DeviceId,
    sub_device: u32,
    region_index: u32,
    tag: Arc<str>,
    flags: Mmio2Flags,
    chunks: Vec<Mmio2Chunk>,
    backing: Vec<PageBacking>,
    mapped_at: Option<u64>,
    overlapping: bool,
    tracking: bool,
    dirty: Vec<u64>,
}

impl Mmio2Registration {
    fn size(&self) -> u64 {
        (self.backing.len() as u64) << PAGE_SHIFT
    }

    /// `(base, last)` of each chunk when mapped at `addr`.
    fn chunk_spans(&self, addr: u64) -> Vec<(u64, u64)> {
        let mut base = addr;
        self.chunks
            .iter()
            .map(|chunk| {
                let last = base + ((chunk.pages as u64) << PAGE_SHIFT) - 1;
                let span = (base, last);
                base = last + 1;
                span
            })
            .collect()
    }

    pub(crate) fn backing_ids(&self) -> impl Iterator<Item = PageId> + '_ {
        self.backing.iter().map(|b| b.page_id)
    }

    /// Records a guest write to the page at `addr`.
    pub(crate) fn mark_dirty(&mut self, addr: u64) {
        let Some(base) = self.mapped_at else {
            return;
        };
        let idx = ((addr - base) >> PAGE_SHIFT) as usize;
        if let Some(word) = self.dirty.get_mut(idx / 64) {
            *word |= 1 << (idx % 64);
        }
    }

    fn info(&self) -> Mmio2Info {
        Mmio2Info {
            handle: self.handle,
            owner: self.owner,
            sub_device: self.sub_device,
            region_index: self.region_index,
            size: self.size(),
            chunk_count: self.chunks.len(),
            mapped_at: self.mapped_at,
            overlapping: self.overlapping,
        }
    }
}

impl SpaceState {
    fn mmio2_mut(&mut self, handle: Mmio2Handle) -> Result<&mut Mmio2Registration> {
        self.mmio2
            .get_mut(&handle.0)
            .ok_or(PhysError::InvalidMmio2Handle(handle.0))
    }

    fn mmio2(&self, handle: Mmio2Handle) -> Result<&Mmio2Registration> {
        self.mmio2
            .get(&handle.0)
            .ok_or(PhysError::InvalidMmio2Handle(handle.0))
    }

    /// Installs one dirty-tracking write handler per chunk of a mapped registration.
    fn arm_dirty_tracking(&mut self, handle: Mmio2Handle) -> Result<()> {
        let reg = self.mmio2(handle)?;
        let Some(addr) = reg.mapped_at else {
            return Ok(());
        };
        let spans = reg.chunk_spans(addr);
        let tag = Arc::clone(&reg.tag);
        for &(base, last) in &spans {
            self.handlers.check_free(base, last)?;
        }
        for (base, last) in spans {
            self.handlers.register(PhysHandler {
                base,
                last,
                kind: HandlerKind::Mmio2Dirty(handle),
                tag: Arc::clone(&tag),
            })?;
            self.set_page_handlers(base, last, HandlerState::Write);
        }
        Ok(())
    }

    /// Links the floating chunk regions of a registration one after another from `addr`. The
    /// range must already be known to be free.
    fn link_mmio2_chunks(&mut self, handle: Mmio2Handle, addr: u64) -> Result<()> {
        let reg = self.mmio2_mut(handle)?;
        if reg.chunks.iter().any(|chunk| chunk.floating.is_none()) {
            return Err(PhysError::WrongState("MMIO2 chunk is not floating"));
        }
        let mut regions = Vec::with_capacity(reg.chunks.len());
        let mut base = addr;
        for chunk in &mut reg.chunks {
            if let Some(mut region) = chunk.floating.take() {
                region.rebase(base);
                region.set_floating(false);
                base += region.size();
                regions.push(region);
            }
        }
        for region in regions {
            self.dir.insert(region)?;
        }
        Ok(())
    }

    /// Moves the chunk regions of a registration mapped at `addr` back to floating.
    fn unlink_mmio2_chunks(&mut self, handle: Mmio2Handle, addr: u64) -> Result<()> {
        let spans = self.mmio2(handle)?.chunk_spans(addr);
        let mut regions = Vec::with_capacity(spans.len());
        for (base, _) in &spans {
            let mut region = self
                .dir
                .remove(*base)
                .ok_or(PhysError::NotMapped { addr: *base })?;
            for page in region.pages_mut() {
                page.set_handler(HandlerState::None);
            }
            region.set_floating(true);
            regions.push(region);
        }
        let reg = self.mmio2_mut(handle)?;
        for (chunk, region) in reg.chunks.iter_mut().zip(regions) {
            chunk.floating = Some(region);
        }
        Ok(())
    }

    fn disarm_dirty_tracking(&mut self, handle: Mmio2Handle) -> Result<()> {
        let reg = self.mmio2(handle)?;
        let Some(addr) = reg.mapped_at else {
            return Ok(());
        };
        for (base, last) in reg.chunk_spans(addr) {
            if self.handlers.remove(base).is_some() {
                self.set_page_handlers(base, last, HandlerState::None);
            }
        }
        Ok(())
    }
}

impl PhysAddressSpace {
    /// Registers an MMIO2 region and allocates all of its backing. Nothing is mapped yet.
    pub fn register_mmio2(
        &self,
        owner: DeviceId,
        sub_device: u32,
        region_index: u32,
        size: u64,
        flags: Mmio2Flags,
        tag: &str,
    ) -> Result<Mmio2Handle> {
        check_range(0, size)?;
        let total_pages = size >> PAGE_SHIFT;
        if total_pages > self.options.max_mmio2_pages {
            return Err(PhysError::InvalidParameter("MMIO2 region is too large"));
        }
        let chunk_pages = self.options.max_mmio2_chunk_pages;
        let chunk_count = total_pages.div_ceil(chunk_pages) as usize;

        let mut state = self.lock_state();
        if state.mmio2.values().any(|r| {
            r.owner == owner && r.sub_device == sub_device && r.region_index == region_index
        }) {
            return Err(PhysError::WrongState("MMIO2 region is already registered"));
        }
        let in_use: usize = state.mmio2.values().map(|r| r.chunks.len()).sum();
        if in_use + chunk_count > self.options.max_mmio2_chunks {
            return Err(PhysError::TooManyMmio2Chunks {
                limit: self.options.max_mmio2_chunks,
            });
        }

        self.allocator.reserve_pages(total_pages)?;
        let backing = self.allocator.allocate_pages(total_pages as usize)?;

        let tag: Arc<str> = Arc::from(tag);
        let chunks = backing
            .chunks(chunk_pages as usize)
            .map(|pages| Mmio2Chunk {
                pages: pages.len(),
                floating: Some(Region::new(
                    0,
                    Arc::clone(&tag),
                    RegionFlags::FLOATING | RegionFlags::MMIO2_CHUNK,
                    pages
                        .iter()
                        .map(|&b| PageDescriptor::allocated(PageKind::Mmio2, b))
                        .collect(),
                )),
            })
            .collect::<Vec<_>>();

        let handle = Mmio2Handle(state.next_mmio2_id);
        state.next_mmio2_id += chunk_count as u32;
        let words = (total_pages as usize).div_ceil(64);
        state.mmio2.insert(
            handle.0,
            Mmio2Registration {
                handle,
                owner,
                sub_device,
                region_index,
                tag: Arc::clone(&tag),
                flags,
                chunks,
                backing,
                mapped_at: None,
                overlapping: false,
                tracking: flags.contains(Mmio2Flags::TRACK_DIRTY_PAGES),
                dirty: vec![0; words],
            },
        );
        debug!(
            handle = handle.0,
            size,
            chunks = chunk_count,
            tag = %tag,
            "registered MMIO2"
        );
        Ok(handle)
    }

    pub fn mmio2_info(&self, handle: Mmio2Handle) -> Option<Mmio2Info> {
        self.lock_state().mmio2.get(&handle.0).map(|r| r.info())
    }

    pub fn mmio2_mapping_address(&self, handle: Mmio2Handle) -> Option<u64> {
        self.lock_state()
            .mmio2
            .get(&handle.0)
            .and_then(|r| r.mapped_at)
    }

    /// Maps a registration at `addr`.
    ///
    /// Inside a RAM region the covered pages must be plain, unlocked RAM; they are freed once
    /// the mapping has been announced. If the execution manager refuses the mapping, everything
    /// is put back as it was.
    pub fn map_mmio2(&self, handle: Mmio2Handle, addr: u64) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let reg = state.mmio2(handle)?;
        if reg.mapped_at.is_some() {
            return Err(PhysError::WrongState("MMIO2 region is already mapped"));
        }
        let size = reg.size();
        let last = check_range(addr, size)?;
        let backing = reg.backing.clone();
        let tag = Arc::clone(&reg.tag);
        let track = reg.tracking;
        state.handlers.check_free(addr, last)?;

        let placement = state.dir.classify(addr, last);
        let displaced = match placement {
            Placement::Contained(base) => {
                let region = state
                    .dir
                    .get(base)
                    .ok_or(PhysError::NotMapped { addr: base })?;
                let (first, last_idx) = page_span(base, addr, last);
                if let Some((idx, page)) = region.pages()[first..=last_idx]
                    .iter()
                    .enumerate()
                    .find(|(_, p)| p.kind() != PageKind::Ram)
                {
                    return Err(PhysError::WrongPageKind {
                        addr: addr + ((idx as u64) << PAGE_SHIFT),
                        kind: page.kind(),
                    });
                }
                state.check_unlocked(addr, last)?;
                let pages = backing
                    .iter()
                    .map(|&b| PageDescriptor::allocated(PageKind::Mmio2, b))
                    .collect();
                Some(state.displace(base, first, pages)?)
            }
            Placement::Free => {
                state.link_mmio2_chunks(handle, addr)?;
                None
            }
            Placement::Conflict { .. } => return Err(state.conflict(addr, last, &placement)),
        };
        let overlapping = displaced.is_some();

        let reg = state.mmio2_mut(handle)?;
        reg.mapped_at = Some(addr);
        reg.overlapping = overlapping;
        let armed = if track {
            state.arm_dirty_tracking(handle)
        } else {
            Ok(())
        };
        let changes = displaced
            .as_ref()
            .map(|d| state.displacement_changes(d))
            .unwrap_or_default();
        let outcome = armed
            .and_then(|()| self.announce_pages(&changes))
            .and_then(|()| {
                self.notify_region(true, region_event(addr, size, PageKind::Mmio2, &tag))
            });

        if let Err(err) = outcome {
            state.disarm_dirty_tracking(handle)?;
            match displaced {
                Some(displaced) => {
                    let undone = state.restore(displaced);
                    self.announce_pages_lenient(&undone);
                }
                None => state.unlink_mmio2_chunks(handle, addr)?,
            }
            let reg = state.mmio2_mut(handle)?;
            reg.mapped_at = None;
            reg.overlapping = false;
            state.mem.tlb.flush();
            drop(guard);
            self.pool_clear();
            debug!(handle = handle.0, addr, error = %err, "MMIO2 mapping refused");
            return Err(err);
        }

        if let Some(displaced) = displaced {
            self.release_displaced(displaced)?;
        }
        state.mem.tlb.flush();
        drop(guard);
        self.pool_clear();
        debug!(handle = handle.0, addr, size, overlapping, "mapped MMIO2");
        Ok(())
    }

    /// Unmaps a registration, restoring the RAM it replaced or removing its chunk regions.
    ///
    /// Fails while any of its pages is locked.
    pub fn unmap_mmio2(&self, handle: Mmio2Handle) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let reg = state.mmio2(handle)?;
        let addr = reg
            .mapped_at
            .ok_or(PhysError::WrongState("MMIO2 region is not mapped"))?;
        let size = reg.size();
        let last = addr + size - 1;
        let overlapping = reg.overlapping;
        let track = reg.tracking;
        let tag = Arc::clone(&reg.tag);
        state.check_unlocked(addr, last)?;

        state.disarm_dirty_tracking(handle)?;
        let displaced = if overlapping {
            let base = state
                .dir
                .lookup(addr)
                .map(Region::base)
                .ok_or(PhysError::NotMapped { addr })?;
            let (first, last_idx) = page_span(base, addr, last);
            let pages = vec![PageDescriptor::zero(PageKind::Ram); last_idx - first + 1];
            Some(state.displace(base, first, pages)?)
        } else {
            state.unlink_mmio2_chunks(handle, addr)?;
            None
        };
        let changes = displaced
            .as_ref()
            .map(|d| state.displacement_changes(d))
            .unwrap_or_default();
        let outcome = self.announce_pages(&changes).and_then(|()| {
            self.notify_region(false, region_event(addr, size, PageKind::Mmio2, &tag))
        });

        if let Err(err) = outcome {
            match displaced {
                Some(displaced) => {
                    let undone = state.restore(displaced);
                    self.announce_pages_lenient(&undone);
                }
                None => state.link_mmio2_chunks(handle, addr)?,
            }
            if track {
                state.arm_dirty_tracking(handle)?;
            }
            state.mem.tlb.flush();
            drop(guard);
            self.pool_clear();
            debug!(handle = handle.0, addr, error = %err, "MMIO2 unmapping refused");
            return Err(err);
        }

        // The displaced descriptors point at the registration's own backing, which it keeps.
        let reg = state.mmio2_mut(handle)?;
        reg.mapped_at = None;
        reg.overlapping = false;
        state.mem.tlb.flush();
        drop(guard);
        self.pool_clear();
        debug!(handle = handle.0, addr, overlapping, "unmapped MMIO2");
        Ok(())
    }

    /// Unmaps (if needed) and frees a registration.
    pub fn deregister_mmio2(&self, handle: Mmio2Handle) -> Result<()> {
        if self.mmio2_mapping_address(handle).is_some() {
            self.unmap_mmio2(handle)?;
        }
        let mut state = self.lock_state();
        let reg = state
            .mmio2
            .remove(&handle.0)
            .ok_or(PhysError::InvalidMmio2Handle(handle.0))?;
        let mut batch = FreeBatch::new(self);
        for page in reg.backing_ids() {
            batch.push(page)?;
        }
        let freed = batch.finish()?;
        state.mem.tlb.flush();
        debug!(handle = handle.0, freed, "deregistered MMIO2");
        Ok(())
    }

    /// Device-side read of MMIO2 memory at `offset` within the registration.
    pub fn read_mmio2(&self, handle: Mmio2Handle, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmio2_access(handle, offset, buf.len(), |ptr, range| {
            // SAFETY: `ptr` addresses a page in a mapped chunk and `range` stays inside it.
            unsafe { copy_from_host(ptr, &mut buf[range]) };
        })
    }

    /// Device-side write of MMIO2 memory. Not recorded by dirty tracking.
    pub fn write_mmio2(&self, handle: Mmio2Handle, offset: u64, data: &[u8]) -> Result<()> {
        self.mmio2_access(handle, offset, data.len(), |ptr, range| {
            // SAFETY: `ptr` addresses a page in a mapped chunk and `range` stays inside it.
            unsafe { copy_to_host(ptr, &data[range]) };
        })
    }

    fn mmio2_access(
        &self,
        handle: Mmio2Handle,
        offset: u64,
        len: usize,
        mut copy: impl FnMut(HostPtr, Range<usize>),
    ) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(PhysError::InvalidParameter("MMIO2 access overflows"))?;
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let in_page = (pos & (PAGE_SIZE - 1)) as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(len - done);
            self.locked(|state| {
                let reg = state.mmio2(handle)?;
                if end > reg.size() {
                    return Err(PhysError::InvalidParameter("MMIO2 access out of bounds").into());
                }
                let backing = reg.backing[(pos >> PAGE_SHIFT) as usize];
                let ptr = self.backing_ptr(&mut state.mem, None, backing)?;
                copy(ptr.offset(in_page), done..done + chunk);
                Ok(())
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Returns the dirty bitmap (one bit per page, LSB first) and clears it, re-arming write
    /// tracking on the pages that were dirty. While tracking is disabled every page is reported
    /// dirty.
    pub fn query_and_reset_mmio2_dirty_bitmap(&self, handle: Mmio2Handle) -> Result<Vec<u64>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let reg = state.mmio2_mut(handle)?;
        if !reg.flags.contains(Mmio2Flags::TRACK_DIRTY_PAGES) {
            return Err(PhysError::WrongState("MMIO2 region does not track dirty pages"));
        }
        let pages = reg.backing.len();
        if !reg.tracking {
            let mut all = vec![u64::MAX; pages.div_ceil(64)];
            if pages % 64 != 0 {
                if let Some(tail) = all.last_mut() {
                    *tail = (1u64 << (pages % 64)) - 1;
                }
            }
            return Ok(all);
        }
        let bitmap = std::mem::replace(&mut reg.dirty, vec![0; pages.div_ceil(64)]);
        if let Some(addr) = reg.mapped_at {
            for idx in 0..pages {
                if bitmap[idx / 64] & (1 << (idx % 64)) == 0 {
                    continue;
                }
                let page_addr = addr + ((idx as u64) << PAGE_SHIFT);
                if let Some(page) = state.dir.page_mut(page_addr) {
                    if page.handler() == HandlerState::Disabled {
                        page.set_handler(HandlerState::Write);
                    }
                }
                state.mem.tlb.invalidate(page_addr);
            }
        }
        drop(guard);
        self.pool_clear();
        Ok(bitmap)
    }

    /// Enables or disables dirty page tracking of a registration created with
    /// [`Mmio2Flags::TRACK_DIRTY_PAGES`].
    pub fn control_mmio2_dirty_tracking(&self, handle: Mmio2Handle, enabled: bool) -> Result<()> {
        let mut state = self.lock_state();
        let reg = state.mmio2_mut(handle)?;
        if !reg.flags.contains(Mmio2Flags::TRACK_DIRTY_PAGES) {
            return Err(PhysError::WrongState("MMIO2 region does not track dirty pages"));
        }
        if reg.tracking == enabled {
            return Ok(());
        }
        reg.tracking = enabled;
        if enabled {
            state.arm_dirty_tracking(handle)?;
        } else {
            state.disarm_dirty_tracking(handle)?;
        }
        drop(state);
        self.pool_clear();
        debug!(handle = handle.0, enabled, "changed MMIO2 dirty tracking");
        Ok(())
    }
}
