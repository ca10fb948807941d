use std::sync::Arc;

use bitflags::bitflags;

use crate::page::PageDescriptor;
use crate::{PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Not linked into the directory (an unmapped MMIO2 chunk).
        const FLOATING = 1 << 0;
        /// Created solely to host an MMIO registration.
        const AD_HOC_MMIO = 1 << 1;
        /// Created solely to host a ROM registration.
        const AD_HOC_ROM = 1 << 2;
        /// Storage belongs to an MMIO2 registration rather than the region.
        const MMIO2_CHUNK = 1 << 3;
    }
}

/// A contiguous, page-aligned guest-physical interval with one descriptor per page.
#[derive(Debug)]
pub(crate) struct Region {
    base: u64,
    tag: Arc<str>,
    flags: RegionFlags,
    pages: Vec<PageDescriptor>,
}

impl Region {
    pub(crate) fn new(
        base: u64,
        tag: Arc<str>,
        flags: RegionFlags,
        pages: Vec<PageDescriptor>,
    ) -> Self {
        debug_assert!(!pages.is_empty());
        debug_assert_eq!(base & (PAGE_SIZE - 1), 0);
        Self {
            base,
            tag,
            flags,
            pages,
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub(crate) fn last(&self) -> u64 {
        self.base + self.size() - 1
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        (self.pages.len() as u64) << PAGE_SHIFT
    }

    #[inline]
    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn tag(&self) -> &Arc<str> {
        &self.tag
    }

    #[inline]
    pub(crate) fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub(crate) fn set_floating(&mut self, floating: bool) {
        self.flags.set(RegionFlags::FLOATING, floating);
    }

    /// Moves a floating region to a new guest-physical base.
    pub(crate) fn rebase(&mut self, base: u64) {
        debug_assert!(self.flags.contains(RegionFlags::FLOATING));
        self.base = base;
    }

    #[inline]
    pub(crate) fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr <= self.last()
    }

    #[inline]
    pub(crate) fn page_index(&self, addr: u64) -> usize {
        debug_assert!(self.contains(addr));
        ((addr - self.base) >> PAGE_SHIFT) as usize
    }

    pub(crate) fn page(&self, addr: u64) -> Option<&PageDescriptor> {
        if !self.contains(addr) {
            return None;
        }
        self.pages.get(self.page_index(addr))
    }

    pub(crate) fn page_mut(&mut self, addr: u64) -> Option<&mut PageDescriptor> {
        if !self.contains(addr) {
            return None;
        }
        let idx = self.page_index(addr);
        self.pages.get_mut(idx)
    }

    #[inline]
    pub(crate) fn pages(&self) -> &[PageDescriptor] {
        &self.pages
    }

    #[inline]
    pub(crate) fn pages_mut(&mut self) -> &mut [PageDescriptor] {
        &mut self.pages
    }

    /// Guest-physical address of page `idx`.
    #[inline]
    pub(crate) fn page_addr(&self, idx: usize) -> u64 {
        self.base + ((idx as u64) << PAGE_SHIFT)
    }

    pub(crate) fn info(&self) -> RegionInfo {
        RegionInfo {
            base: self.base,
            last: self.last(),
            tag: self.tag.to_string(),
            flags: self.flags,
            page_count: self.pages.len() as u64,
        }
    }
}

/// Read-only description of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: u64,
    pub last: u64,
    pub tag: String,
    pub flags: RegionFlags,
    pub page_count: u64,
}

impl RegionInfo {
    pub fn size(&self) -> u64 {
        self.page_count << PAGE_SHIFT
    }
}
