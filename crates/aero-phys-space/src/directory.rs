//! Address-ordered region directory.
//!
//! Regions are kept in a single `BTreeMap` keyed by base address. Invariants:
//! - `regions[k].base() == k`
//! - for consecutive entries `a`, `b`: `a.last() < b.base()`
//!
//! Every structural change bumps a shared generation counter so that readers which cache lookup
//! results without holding the address-space lock can detect that they went stale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{PhysError, Result};
use crate::page::PageDescriptor;
use crate::region::Region;

/// Where a candidate range falls relative to the existing regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Placement {
    /// No region intersects the range.
    Free,
    /// One region fully contains the range; the value is that region's base.
    Contained(u64),
    /// The range partially overlaps one or more regions.
    Conflict {
        base: u64,
        last: u64,
        tag: String,
    },
}

#[derive(Debug)]
pub(crate) struct RegionDirectory {
    regions: BTreeMap<u64, Region>,
    generation: Arc<AtomicU64>,
}

impl RegionDirectory {
    pub(crate) fn new(generation: Arc<AtomicU64>) -> Self {
        Self {
            regions: BTreeMap::new(),
            generation,
        }
    }

    pub(crate) fn lookup(&self, addr: u64) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| addr <= region.last())
    }

    pub(crate) fn lookup_mut(&mut self, addr: u64) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| addr <= region.last())
    }

    pub(crate) fn page(&self, addr: u64) -> Option<&PageDescriptor> {
        self.lookup(addr)?.page(addr)
    }

    pub(crate) fn page_mut(&mut self, addr: u64) -> Option<&mut PageDescriptor> {
        self.lookup_mut(addr)?.page_mut(addr)
    }

    pub(crate) fn get(&self, base: u64) -> Option<&Region> {
        self.regions.get(&base)
    }

    pub(crate) fn get_mut(&mut self, base: u64) -> Option<&mut Region> {
        self.regions.get_mut(&base)
    }

    pub(crate) fn classify(&self, base: u64, last: u64) -> Placement {
        debug_assert!(base <= last);
        let Some((_, region)) = self.regions.range(..=last).next_back() else {
            return Placement::Free;
        };
        if region.last() < base {
            return Placement::Free;
        }
        if region.base() <= base && last <= region.last() {
            return Placement::Contained(region.base());
        }
        Placement::Conflict {
            base: region.base(),
            last: region.last(),
            tag: region.tag().to_string(),
        }
    }

    /// Links a region; the range must not intersect any existing region.
    pub(crate) fn insert(&mut self, region: Region) -> Result<()> {
        let existing = match self.classify(region.base(), region.last()) {
            Placement::Free => None,
            Placement::Contained(base) => self
                .regions
                .get(&base)
                .map(|r| (r.base(), r.last(), r.tag().to_string())),
            Placement::Conflict { base, last, tag } => Some((base, last, tag)),
        };
        if let Some((existing_base, existing_last, existing_tag)) = existing {
            return Err(PhysError::Conflict {
                base: region.base(),
                last: region.last(),
                existing_base,
                existing_last,
                existing_tag,
            });
        }
        self.regions.insert(region.base(), region);
        self.bump();
        Ok(())
    }

    pub(crate) fn remove(&mut self, base: u64) -> Option<Region> {
        let region = self.regions.remove(&base)?;
        self.bump();
        Some(region)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.regions.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.regions.len()
    }

    /// Records a change to page descriptors that lockless readers may have cached.
    pub(crate) fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
