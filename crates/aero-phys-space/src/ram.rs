use std::sync::Arc;

use tracing::debug;

use crate::directory::Placement;
use crate::error::Result;
use crate::page::{PageDescriptor, PageKind};
use crate::region::{Region, RegionFlags};
use crate::space::{check_range, region_event, PhysAddressSpace};
use crate::PAGE_SHIFT;

impl PhysAddressSpace {
    /// Registers a RAM range. The range must not intersect any existing region.
    ///
    /// Pages start out in the Zero state and get backing on first write, unless the space was
    /// configured with `preallocate_ram`.
    pub fn register_ram(&self, addr: u64, size: u64, tag: &str) -> Result<()> {
        let last = check_range(addr, size)?;
        let count = (size >> PAGE_SHIFT) as usize;

        let mut state = self.lock_state();
        let placement = state.dir.classify(addr, last);
        if placement != Placement::Free {
            return Err(state.conflict(addr, last, &placement));
        }

        self.allocator.reserve_pages(count as u64)?;
        let pages = if self.options.preallocate_ram {
            self.allocator
                .allocate_pages(count)?
                .into_iter()
                .map(|backing| PageDescriptor::allocated(PageKind::Ram, backing))
                .collect()
        } else {
            vec![PageDescriptor::zero(PageKind::Ram); count]
        };
        state.dir.insert(Region::new(
            addr,
            Arc::from(tag),
            RegionFlags::empty(),
            pages,
        ))?;

        if let Err(err) = self.notify_region(true, region_event(addr, size, PageKind::Ram, tag)) {
            if let Some(region) = state.dir.remove(addr) {
                let ids: Vec<_> = region.pages().iter().filter_map(|p| p.page_id()).collect();
                if !ids.is_empty() {
                    self.allocator.free_pages(&ids)?;
                }
            }
            return Err(err);
        }

        debug!(addr, size, tag, "registered RAM");
        Ok(())
    }
}
