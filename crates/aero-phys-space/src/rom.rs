//! ROM overlays.
//!
//! Every ROM page has a virgin copy holding the image and, when the ROM is shadowed, a shadow
//! copy that behaves like RAM once enabled. Exactly one of the two is live in the directory; the
//! other is kept in [`RomPage::stored`]. The protection mode picks which one is live and where
//! writes go.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::alloc::FreeBatch;
use crate::directory::Placement;
use crate::error::{PhysError, Result};
use crate::handler::{HandlerKind, PhysHandler};
use crate::page::{HandlerState, PageBacking, PageDescriptor, PageKind};
use crate::region::{Region, RegionFlags};
use crate::space::{
    check_range, copy_from_host, copy_to_host, page_span, region_event, PhysAddressSpace,
    SpaceState,
};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Which copy of a ROM page reads come from and where writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RomProt {
    ReadRomWriteIgnore,
    ReadRomWriteRam,
    ReadRamWriteIgnore,
    ReadRamWriteRam,
}

impl RomProt {
    /// Whether the virgin copy is live.
    pub fn is_rom(self) -> bool {
        matches!(self, RomProt::ReadRomWriteIgnore | RomProt::ReadRomWriteRam)
    }

    pub fn writes_ram(self) -> bool {
        matches!(self, RomProt::ReadRomWriteRam | RomProt::ReadRamWriteRam)
    }

    fn page_handler(self) -> HandlerState {
        match self {
            RomProt::ReadRamWriteRam => HandlerState::None,
            _ => HandlerState::Write,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RomFlags: u32 {
        /// The ROM has a RAM shadow selectable through [`PhysAddressSpace::protect_rom`].
        const SHADOWED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RomCopy {
    Virgin,
    Shadow,
}

impl RomCopy {
    fn other(self) -> Self {
        match self {
            RomCopy::Virgin => RomCopy::Shadow,
            RomCopy::Shadow => RomCopy::Virgin,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RomPage {
    /// The copy that is not live. `None` for ROMs without a shadow.
    pub(crate) stored: Option<PageDescriptor>,
    pub(crate) live: RomCopy,
    pub(crate) prot: RomProt,
}

impl RomPage {
    /// Exchanges the live descriptor with the stored one. The live slot keeps its lock
    /// counters and handler state.
    pub(crate) fn swap_active(&mut self, live: &mut PageDescriptor) {
        let Some(stored) = self.stored.as_mut() else {
            return;
        };
        let previous = live.clone();
        live.assume_content_of(stored);
        stored.assume_content_of(&previous);
        self.live = self.live.other();
    }

    /// The shadow copy when it is the stored one.
    pub(crate) fn stored_shadow_mut(&mut self) -> Option<&mut PageDescriptor> {
        match self.live {
            RomCopy::Virgin => self.stored.as_mut(),
            RomCopy::Shadow => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RomOverlay {
    pub(crate) base: u64,
    pub(crate) last: u64,
    pub(crate) flags: RomFlags,
    pub(crate) tag: Arc<str>,
    pub(crate) image: Arc<[u8]>,
    pub(crate) pages: Vec<RomPage>,
}

impl RomOverlay {
    fn page_index(&self, addr: u64) -> usize {
        ((addr - self.base) >> PAGE_SHIFT) as usize
    }

    /// Image bytes of page `idx`, zero-padded to a full page.
    fn page_image(&self, idx: usize) -> [u8; PAGE_SIZE as usize] {
        page_image(&self.image, idx)
    }
}

fn page_image(image: &[u8], idx: usize) -> [u8; PAGE_SIZE as usize] {
    let mut buf = [0u8; PAGE_SIZE as usize];
    let start = idx << PAGE_SHIFT;
    if start < image.len() {
        let end = (start + PAGE_SIZE as usize).min(image.len());
        buf[..end - start].copy_from_slice(&image[start..end]);
    }
    buf
}

/// What a guest write to a ROM page does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RomWrite {
    Ignore,
    /// Written into the stored shadow copy while the virgin copy stays live.
    Shadow,
}

/// The ROM page covering `addr`, if any.
pub(crate) fn rom_page_mut(roms: &mut [RomOverlay], addr: u64) -> Option<&mut RomPage> {
    let at = roms.partition_point(|r| r.last < addr);
    let overlay = roms.get_mut(at).filter(|r| r.base <= addr)?;
    let idx = overlay.page_index(addr);
    overlay.pages.get_mut(idx)
}

impl RomPage {
    pub(crate) fn write_target(&self) -> RomWrite {
        if self.stored.is_some() && self.prot == RomProt::ReadRomWriteRam {
            RomWrite::Shadow
        } else {
            RomWrite::Ignore
        }
    }
}

impl SpaceState {
    /// Where a ROM may go: `Some(base)` of the RAM region containing it, `None` for free space.
    fn rom_target(&self, addr: u64, last: u64) -> Result<Option<u64>> {
        self.handlers.check_free(addr, last)?;
        let placement = self.dir.classify(addr, last);
        match placement {
            Placement::Free => Ok(None),
            Placement::Contained(base) => {
                let region = self
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
                self.check_unlocked(addr, last)?;
                Ok(Some(base))
            }
            Placement::Conflict { .. } => Err(self.conflict(addr, last, &placement)),
        }
    }
}

impl PhysAddressSpace {
    /// Registers a ROM image at `addr`.
    ///
    /// The image is copied into freshly allocated virgin pages before anything becomes visible
    /// to the guest; missing bytes at the end read as zero. The destination is either free
    /// space, in which case an ad-hoc region is created, or RAM pages of a single region.
    pub fn register_rom(
        &self,
        addr: u64,
        size: u64,
        image: &[u8],
        flags: RomFlags,
        tag: &str,
    ) -> Result<()> {
        let last = check_range(addr, size)?;
        if image.len() as u64 > size {
            return Err(PhysError::InvalidParameter("ROM image is larger than the range"));
        }
        let count = (size >> PAGE_SHIFT) as usize;
        let shadowed = flags.contains(RomFlags::SHADOWED);

        let virgin = {
            let state = self.lock_state();
            state.rom_target(addr, last)?;
            let reserve = if shadowed { 2 * count } else { count };
            self.allocator.reserve_pages(reserve as u64)?;
            self.allocator.allocate_pages(count)?
        };

        if let Err(err) = self
            .fill_rom_pages(&virgin, image)
            .and_then(|()| self.commit_rom(addr, last, &virgin, image, flags, tag))
        {
            let mut batch = FreeBatch::new(self);
            for b in &virgin {
                batch.push(b.page_id)?;
            }
            batch.finish()?;
            return Err(err);
        }
        Ok(())
    }

    fn fill_rom_pages(&self, pages: &[PageBacking], image: &[u8]) -> Result<()> {
        for (idx, &backing) in pages.iter().enumerate() {
            let data = page_image(image, idx);
            self.locked(|state| {
                let ptr = self.backing_ptr(&mut state.mem, None, backing)?;
                // SAFETY: `ptr` addresses a whole page in a mapped chunk; the lock is held.
                unsafe { copy_to_host(ptr, &data) };
                Ok(())
            })?;
        }
        Ok(())
    }

    fn commit_rom(
        &self,
        addr: u64,
        last: u64,
        virgin: &[PageBacking],
        image: &[u8],
        flags: RomFlags,
        tag: &str,
    ) -> Result<()> {
        let size = last - addr + 1;
        let tag: Arc<str> = Arc::from(tag);
        let shadowed = flags.contains(RomFlags::SHADOWED);
        let prot = RomProt::ReadRomWriteIgnore;

        let mut guard = self.lock_state();
        let state = &mut *guard;
        // The lock was dropped while the image was copied; check again.
        let target = state.rom_target(addr, last)?;
        let displaced = match target {
            Some(base) => {
                let (first, _) = page_span(base, addr, last);
                let pages = virgin
                    .iter()
                    .map(|&b| PageDescriptor::allocated(PageKind::Rom, b))
                    .collect();
                Some(state.displace(base, first, pages)?)
            }
            None => {
                state.dir.insert(Region::new(
                    addr,
                    Arc::clone(&tag),
                    RegionFlags::AD_HOC_ROM,
                    virgin
                        .iter()
                        .map(|&b| PageDescriptor::allocated(PageKind::Rom, b))
                        .collect(),
                ))?;
                if let Err(err) =
                    self.notify_region(true, region_event(addr, size, PageKind::Rom, &tag))
                {
                    state.dir.remove(addr);
                    return Err(err);
                }
                None
            }
        };

        let registered = state.handlers.register(PhysHandler {
            base: addr,
            last,
            kind: HandlerKind::Rom,
            tag: Arc::clone(&tag),
        });
        if let Err(err) = registered {
            match displaced {
                Some(displaced) => {
                    state.restore(displaced);
                }
                None => {
                    state.dir.remove(addr);
                }
            }
            return Err(err);
        }
        state.set_page_handlers(addr, last, prot.page_handler());

        if let Some(displaced) = displaced {
            let changes = state.displacement_changes(&displaced);
            if let Err(err) = self.announce_pages(&changes) {
                state.handlers.remove(addr);
                let undone = state.restore(displaced);
                self.announce_pages_lenient(&undone);
                return Err(err);
            }
            self.release_displaced(displaced)?;
        }

        let pages = (0..virgin.len())
            .map(|_| RomPage {
                stored: shadowed.then(|| PageDescriptor::zero(PageKind::RomShadow)),
                live: RomCopy::Virgin,
                prot,
            })
            .collect();
        let at = state.roms.partition_point(|r| r.base < addr);
        state.roms.insert(
            at,
            RomOverlay {
                base: addr,
                last,
                flags,
                tag: Arc::clone(&tag),
                image: Arc::from(image),
                pages,
            },
        );
        drop(guard);
        self.pool_clear();
        debug!(addr, size, shadowed, ad_hoc = target.is_none(), tag = %tag, "registered ROM");
        Ok(())
    }

    /// Changes the protection mode of the shadowed ROM pages in `addr..addr + size`.
    ///
    /// Pages of ROMs without a shadow are left alone. Nothing is invalidated when every page
    /// already has the requested mode.
    pub fn protect_rom(&self, addr: u64, size: u64, prot: RomProt) -> Result<()> {
        let last = check_range(addr, size)?;
        let mut guard = self.lock_state();
        let SpaceState { dir, roms, mem, .. } = &mut *guard;

        let mut changed = 0usize;
        let mut swapped = Vec::new();
        for overlay in roms.iter_mut() {
            if overlay.last < addr || overlay.base > last {
                continue;
            }
            if !overlay.flags.contains(RomFlags::SHADOWED) {
                continue;
            }
            let start = overlay.base.max(addr);
            let end = overlay.last.min(last);
            for page_addr in (start..=end).step_by(PAGE_SIZE as usize) {
                let idx = ((page_addr - overlay.base) >> PAGE_SHIFT) as usize;
                let rom_page = &mut overlay.pages[idx];
                if rom_page.prot == prot {
                    continue;
                }
                let live = dir
                    .page_mut(page_addr)
                    .ok_or(PhysError::NotMapped { addr: page_addr })?;
                if rom_page.prot.is_rom() != prot.is_rom() {
                    let old = live.backing();
                    rom_page.swap_active(live);
                    swapped.push((page_addr, old));
                }
                rom_page.prot = prot;
                live.set_handler(prot.page_handler());
                mem.tlb.invalidate(page_addr);
                changed += 1;
            }
        }
        if changed == 0 {
            return Ok(());
        }
        dir.bump();
        for &(page_addr, old) in &swapped {
            self.pool_invalidate(page_addr);
            if let Some(page) = dir.page(page_addr) {
                self.notify_page_changed(Self::page_change(page_addr, old, page, None))?;
            }
        }
        drop(guard);
        debug!(
            addr,
            size,
            prot = ?prot,
            changed,
            swapped = swapped.len(),
            "changed ROM protection"
        );
        Ok(())
    }

    /// The persisted-state layer asks for the virgin pages to be rewritten from the image on the
    /// next [`PhysAddressSpace::reset_roms`], e.g. after a saved state was loaded.
    pub fn request_rom_restore_on_reset(&self) {
        self.lock_state().restore_rom_on_reset = true;
    }

    /// Puts every ROM back into its power-on state.
    ///
    /// Shadowed ROMs switch to [`RomProt::ReadRomWriteIgnore`] and lose their shadow content.
    /// Virgin pages are checked against the image and rewritten when a restore was requested.
    /// Nothing changes while a shadow page in use is locked.
    pub fn reset_roms(&self) -> Result<()> {
        let (virgin, restore) = {
            let mut guard = self.lock_state();
            let SpaceState { dir, roms, mem, .. } = &mut *guard;
            // A live shadow is freed below; a lock on it would keep pointing at the old page.
            for overlay in roms.iter() {
                for (idx, rom_page) in overlay.pages.iter().enumerate() {
                    let page_addr = overlay.base + ((idx as u64) << PAGE_SHIFT);
                    if rom_page.live == RomCopy::Shadow
                        && dir.page(page_addr).is_some_and(PageDescriptor::is_locked)
                    {
                        return Err(PhysError::WrongState("page is locked"));
                    }
                }
            }
            let mut batch = FreeBatch::new(self);
            let mut virgin = Vec::new();
            for overlay in roms.iter_mut() {
                let shadowed = overlay.flags.contains(RomFlags::SHADOWED);
                for idx in 0..overlay.pages.len() {
                    let page_addr = overlay.base + ((idx as u64) << PAGE_SHIFT);
                    let expected = overlay.page_image(idx);
                    let live = dir
                        .page_mut(page_addr)
                        .ok_or(PhysError::NotMapped { addr: page_addr })?;
                    let rom_page = &mut overlay.pages[idx];
                    if shadowed {
                        if rom_page.live == RomCopy::Shadow {
                            rom_page.swap_active(live);
                        }
                        rom_page.prot = RomProt::ReadRomWriteIgnore;
                        if let Some(shadow) = rom_page.stored_shadow_mut() {
                            self.free_page(mem, &mut batch, shadow, None)?;
                        }
                    }
                    live.set_handler(rom_page.prot.page_handler());
                    mem.tlb.invalidate(page_addr);
                    if let Some(backing) = live.backing() {
                        virgin.push((page_addr, Arc::clone(&overlay.tag), backing, expected));
                    }
                }
            }
            batch.finish()?;
            dir.bump();
            let restore = std::mem::replace(&mut guard.restore_rom_on_reset, false);
            (virgin, restore)
        };
        self.pool_clear();

        let mut mismatched = 0usize;
        for (page_addr, tag, backing, expected) in &virgin {
            let matches = self.locked(|state| {
                let ptr = self.backing_ptr(&mut state.mem, None, *backing)?;
                let mut current = [0u8; PAGE_SIZE as usize];
                // SAFETY: `ptr` addresses a whole page in a mapped chunk; the lock is held.
                unsafe {
                    copy_from_host(ptr, &mut current);
                    if restore {
                        copy_to_host(ptr, expected);
                    }
                }
                Ok(current == *expected)
            })?;
            if !matches {
                mismatched += 1;
                if !restore {
                    warn!(addr = *page_addr, tag = %tag, "ROM page content differs from its image");
                }
            }
        }
        debug!(pages = virgin.len(), mismatched, restored = restore, "reset ROMs");
        Ok(())
    }

    /// Protection mode of the ROM page at `addr`.
    pub fn rom_protection(&self, addr: u64) -> Option<RomProt> {
        rom_page_mut(&mut self.lock_state().roms, addr).map(|p| p.prot)
    }
}
