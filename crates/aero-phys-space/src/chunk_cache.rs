//! Bounded cache of host chunk mappings.
//!
//! Entries move through `Unmapped -> Mapped(refs = 0) <-> Mapped(refs > 0) -> Unmapped`. The
//! cache itself never calls the host allocator; [`crate::PhysAddressSpace`] drives mapping and
//! eviction and only removes entries whose reference counts are both zero.

use std::collections::BTreeMap;

use crate::host::HostPtr;
use crate::page::ChunkId;

/// Clock value the generation counter restarts at after wrapping.
const CLOCK_RESTART: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkMapEntry {
    ptr: HostPtr,
    refs: u32,
    perm_refs: u32,
    last_used: u32,
}

impl ChunkMapEntry {
    #[inline]
    pub(crate) fn is_pinned(&self) -> bool {
        self.refs != 0 || self.perm_refs != 0
    }
}

#[derive(Debug)]
pub(crate) struct ChunkMapCache {
    entries: BTreeMap<ChunkId, ChunkMapEntry>,
    capacity: usize,
    now: u32,
    evictions: u64,
}

impl ChunkMapCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
            now: 0,
            evictions: 0,
        }
    }

    /// Advances the recency clock.
    ///
    /// When the clock wraps, every age is collapsed into one of four buckets so the relative
    /// order of recently used entries survives.
    fn tick(&mut self) -> u32 {
        self.now = self.now.wrapping_add(1);
        if self.now == 0 {
            self.now = CLOCK_RESTART;
            for entry in self.entries.values_mut() {
                entry.last_used = match entry.last_used {
                    age if age >= 0xffff_ff00 => 3,
                    age if age >= 0xffff_f000 => 2,
                    0 => 4,
                    _ => 1,
                };
            }
        }
        self.now
    }

    /// Returns the mapping of a cached chunk and marks it as recently used.
    pub(crate) fn touch(&mut self, id: ChunkId) -> Option<HostPtr> {
        if !self.entries.contains_key(&id) {
            return None;
        }
        let now = self.tick();
        let entry = self.entries.get_mut(&id)?;
        entry.last_used = now;
        Some(entry.ptr)
    }

    pub(crate) fn insert(&mut self, id: ChunkId, ptr: HostPtr) {
        let now = self.tick();
        self.entries.insert(
            id,
            ChunkMapEntry {
                ptr,
                refs: 0,
                perm_refs: 0,
                last_used: now,
            },
        );
    }

    pub(crate) fn add_ref(&mut self, id: ChunkId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Pins a chunk for the lifetime of the cache (a page lock went permanent).
    pub(crate) fn add_permanent_ref(&mut self, id: ChunkId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.perm_refs += 1;
                true
            }
            None => false,
        }
    }

    pub(crate) fn release(&mut self, id: ChunkId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.refs > 0 => {
                entry.refs -= 1;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Picks the least recently used entry that is not pinned and not rejected by `skip`.
    ///
    /// This is a linear scan over all entries; misses are rare next to hits and the cache is
    /// small, so no separate recency index is kept.
    pub(crate) fn find_eviction_candidate(
        &self,
        skip: impl Fn(ChunkId) -> bool,
    ) -> Option<ChunkId> {
        self.entries
            .iter()
            .filter(|(id, entry)| !entry.is_pinned() && !skip(**id))
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| *id)
    }

    pub(crate) fn has_unpinned(&self) -> bool {
        self.entries.values().any(|entry| !entry.is_pinned())
    }

    pub(crate) fn remove(&mut self, id: ChunkId) -> Option<ChunkMapEntry> {
        debug_assert!(self.entries.get(&id).map_or(true, |e| !e.is_pinned()));
        let entry = self.entries.remove(&id)?;
        self.evictions += 1;
        Some(entry)
    }

    /// Drops every entry regardless of references; used on termination.
    pub(crate) fn drain(&mut self) -> Vec<ChunkId> {
        let ids = self.entries.keys().copied().collect();
        self.entries.clear();
        ids
    }

    #[inline]
    pub(crate) fn contains(&self, id: ChunkId) -> bool {
        self.entries.contains_key(&id)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn evictions(&self) -> u64 {
        self.evictions
    }

    pub(crate) fn refs(&self, id: ChunkId) -> Option<(u32, u32)> {
        self.entries.get(&id).map(|e| (e.refs, e.perm_refs))
    }

    #[cfg(test)]
    fn last_used(&self, id: ChunkId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.last_used)
    }

    #[cfg(test)]
    fn set_clock(&mut self, now: u32) {
        self.now = now;
    }
}
