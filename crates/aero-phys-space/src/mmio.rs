use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::directory::Placement;
use crate::error::{PhysError, Result};
use crate::handler::{HandlerKind, MmioHandler, PhysHandler};
use crate::page::{HandlerState, PageDescriptor, PageKind};
use crate::region::{Region, RegionFlags};
use crate::space::{check_range, page_span, region_event, PhysAddressSpace};
use crate::PAGE_SHIFT;

impl PhysAddressSpace {
    /// Registers an MMIO range served by `handler`.
    ///
    /// When a RAM region fully contains the range, the covered pages are freed and become MMIO
    /// pages; when the range is free an ad-hoc MMIO region is created. Partially overlapping a
    /// region, or covering pages that are neither RAM nor MMIO, is a conflict. Locked RAM pages
    /// cannot be taken over.
    pub fn register_mmio(
        &self,
        addr: u64,
        size: u64,
        handler: Box<dyn MmioHandler>,
        tag: &str,
    ) -> Result<()> {
        let last = check_range(addr, size)?;
        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.handlers.check_free(addr, last)?;

        let tag: Arc<str> = Arc::from(tag);
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
                    .find(|(_, p)| !matches!(p.kind(), PageKind::Ram | PageKind::Mmio))
                {
                    return Err(PhysError::WrongPageKind {
                        addr: addr + ((idx as u64) << PAGE_SHIFT),
                        kind: page.kind(),
                    });
                }
                state.check_unlocked(addr, last)?;
                let pages = vec![PageDescriptor::zero(PageKind::Mmio); last_idx - first + 1];
                Some(state.displace(base, first, pages)?)
            }
            Placement::Free => {
                let count = (size >> PAGE_SHIFT) as usize;
                state.dir.insert(Region::new(
                    addr,
                    Arc::clone(&tag),
                    RegionFlags::AD_HOC_MMIO,
                    vec![PageDescriptor::zero(PageKind::Mmio); count],
                ))?;
                if let Err(err) =
                    self.notify_region(true, region_event(addr, size, PageKind::Mmio, &tag))
                {
                    state.dir.remove(addr);
                    return Err(err);
                }
                None
            }
            Placement::Conflict { .. } => return Err(state.conflict(addr, last, &placement)),
        };
        let ad_hoc = displaced.is_none();

        let registered = state.handlers.register(PhysHandler {
            base: addr,
            last,
            kind: HandlerKind::Mmio(Arc::new(Mutex::new(handler))),
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
        state.set_page_handlers(addr, last, HandlerState::All);

        if let Some(displaced) = displaced {
            let changes = state.displacement_changes(&displaced);
            if let Err(err) = self.announce_pages(&changes) {
                state.handlers.remove(addr);
                let undone = state.restore(displaced);
                self.announce_pages_lenient(&undone);
                return Err(err);
            }
            self.release_displaced(displaced)?;
            self.pool_clear();
        }
        debug!(addr, size, tag = %tag, ad_hoc, "registered MMIO");
        Ok(())
    }

    /// Removes an MMIO registration made with [`PhysAddressSpace::register_mmio`].
    pub fn deregister_mmio(&self, addr: u64, size: u64) -> Result<()> {
        let last = check_range(addr, size)?;
        let mut guard = self.lock_state();
        let state = &mut *guard;

        match state.handlers.find(addr) {
            Some(h)
                if h.base == addr && h.last == last && matches!(h.kind, HandlerKind::Mmio(_)) => {}
            _ => return Err(PhysError::NotFound("MMIO registration")),
        }

        let region = state
            .dir
            .lookup(addr)
            .ok_or(PhysError::NotMapped { addr })?;
        let dead_ad_hoc = region.base() == addr
            && region.last() == last
            && region.flags().contains(RegionFlags::AD_HOC_MMIO)
            && region.pages().iter().all(|p| p.kind().is_mmio());
        if dead_ad_hoc {
            // Announced before anything changes so a refusal leaves the registration intact.
            self.notify_region(false, region_event(addr, size, PageKind::Mmio, region.tag()))?;
        }

        state.handlers.remove(addr);
        state.set_page_handlers(addr, last, HandlerState::None);
        if dead_ad_hoc {
            state.dir.remove(addr);
        } else if let Some(region) = state.dir.lookup_mut(addr) {
            let base = region.base();
            let (first, last_idx) = page_span(base, addr, last);
            for page in &mut region.pages_mut()[first..=last_idx] {
                if page.kind().is_mmio() {
                    page.set_kind(PageKind::Ram);
                }
            }
            state.dir.bump();
        }

        state.mem.tlb.flush();
        drop(guard);
        self.pool_clear();
        debug!(addr, size, removed_region = dead_ad_hoc, "deregistered MMIO");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HeapAllocator;
    use crate::options::PhysSpaceOptions;
    use crate::PAGE_SIZE;

    struct Nop;

    impl MmioHandler for Nop {
        fn read(&mut self, _offset: u64, _size: usize) -> u64 {
            0
        }

        fn write(&mut self, _offset: u64, _size: usize, _value: u64) {}
    }

    fn space() -> PhysAddressSpace {
        PhysAddressSpace::new(Arc::new(HeapAllocator::new(2)), PhysSpaceOptions::default())
            .unwrap()
    }

    #[test]
    fn mmio_carved_out_of_ram_returns_to_ram() {
        let space = space();
        space.register_ram(0, 8 * PAGE_SIZE, "ram").unwrap();
        space
            .register_mmio(2 * PAGE_SIZE, 2 * PAGE_SIZE, Box::new(Nop), "dev")
            .unwrap();

        let page = space.page_info(2 * PAGE_SIZE).unwrap();
        assert_eq!(page.kind, PageKind::Mmio);
        assert_eq!(page.handler, HandlerState::All);
        assert_eq!(space.regions().len(), 1);

        space.deregister_mmio(2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        let page = space.page_info(2 * PAGE_SIZE).unwrap();
        assert_eq!(page.kind, PageKind::Ram);
        assert_eq!(page.handler, HandlerState::None);
        assert_eq!(space.regions().len(), 1);
    }

    #[test]
    fn ad_hoc_mmio_region_is_removed_on_deregistration() {
        let space = space();
        space
            .register_mmio(0xfee0_0000, PAGE_SIZE, Box::new(Nop), "apic")
            .unwrap();
        let region = space.lookup_region(0xfee0_0000).unwrap();
        assert!(region.flags.contains(RegionFlags::AD_HOC_MMIO));

        space.deregister_mmio(0xfee0_0000, PAGE_SIZE).unwrap();
        assert!(space.regions().is_empty());
        assert!(matches!(
            space.deregister_mmio(0xfee0_0000, PAGE_SIZE),
            Err(PhysError::NotFound(_))
        ));
    }

    #[test]
    fn overlapping_mmio_handlers_conflict() {
        let space = space();
        space.register_ram(0, 8 * PAGE_SIZE, "ram").unwrap();
        space
            .register_mmio(0, 2 * PAGE_SIZE, Box::new(Nop), "a")
            .unwrap();
        assert!(matches!(
            space.register_mmio(PAGE_SIZE, 2 * PAGE_SIZE, Box::new(Nop), "b"),
            Err(PhysError::HandlerConflict { .. })
        ));
    }
}
