//! Page mapping locks.
//!
//! A [`PageMappingLock`] gives a device direct access to one guest page. While it is held the
//! page keeps its backing and the chunk behind it stays mapped. Lock counters saturate; a page
//! locked [`crate::page::MAX_PAGE_LOCKS`] times stays locked (and its chunk mapped) for the life
//! of the address space.

use tracing::{trace, warn};

use crate::error::{PhysError, Result};
use crate::host::HostPtr;
use crate::page::{ChunkId, LockTransition, UnlockTransition};
use crate::space::{copy_from_host, copy_to_host, PhysAddressSpace, SpaceState};
use crate::PAGE_SIZE;

/// Direct host access to a guest page. Released on drop.
#[must_use = "the page is unlocked as soon as the lock is dropped"]
pub struct PageMappingLock<'a> {
    space: &'a PhysAddressSpace,
    addr: u64,
    ptr: HostPtr,
    /// Chunk reference held by this lock; `None` for the zero page and saturated counters.
    chunk: Option<ChunkId>,
    writable: bool,
}

impl PhysAddressSpace {
    /// Locks the page at `addr` for writing, allocating private backing first.
    pub fn map_page_for_write(&self, addr: u64) -> Result<PageMappingLock<'_>> {
        self.map_page(addr, true)
    }

    /// Locks the page at `addr` for reading. Pages without backing map the shared zero page.
    pub fn map_page_read_only(&self, addr: u64) -> Result<PageMappingLock<'_>> {
        self.map_page(addr, false)
    }

    /// Locks several pages. Either every page is locked or none is.
    pub fn bulk_map_pages(
        &self,
        addrs: &[u64],
        writable: bool,
    ) -> Result<Vec<PageMappingLock<'_>>> {
        addrs.iter().map(|&addr| self.map_page(addr, writable)).collect()
    }

    fn map_page(&self, addr: u64, writable: bool) -> Result<PageMappingLock<'_>> {
        let addr = addr & !(PAGE_SIZE - 1);
        let (ptr, chunk) = self.locked(|state| {
            let SpaceState { dir, mem, .. } = state;
            let page = dir.page_mut(addr).ok_or(PhysError::NotMapped { addr })?;
            let handler = page.handler();
            if page.kind().is_mmio()
                || handler.traps_reads()
                || (writable && handler.traps_writes())
            {
                return Err(PhysError::ReservedPage { addr }.into());
            }
            if writable {
                self.make_writable(mem, page, Some(addr))?;
            }
            let (ptr, chunk) = match page.backing() {
                Some(backing) => (
                    self.backing_ptr(mem, Some(addr), backing)?,
                    Some(backing.page_id.chunk(self.chunk_shift)),
                ),
                None => (self.zero_page_ptr(), None),
            };

            let held = match page.lock(writable) {
                LockTransition::First => {
                    if writable {
                        mem.write_locked_pages += 1;
                    } else {
                        mem.read_locked_pages += 1;
                    }
                    chunk
                }
                LockTransition::Counted => chunk,
                LockTransition::Saturated => {
                    if let Some(chunk) = chunk {
                        mem.chunks.add_permanent_ref(chunk);
                    }
                    warn!(addr, writable, "page lock counter saturated; page stays locked");
                    None
                }
                LockTransition::Permanent => None,
            };
            if let Some(chunk) = held {
                mem.chunks.add_ref(chunk);
            }
            Ok((ptr, held))
        })?;
        trace!(addr, writable, "locked page mapping");
        Ok(PageMappingLock {
            space: self,
            addr,
            ptr,
            chunk,
            writable,
        })
    }
}

impl PageMappingLock<'_> {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// `None` for read-only locks.
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.writable.then(|| self.ptr.as_ptr())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE as usize => Ok(()),
            _ => Err(PhysError::InvalidParameter("access beyond the locked page")),
        }
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: the range was checked against the page, whose mapping this lock keeps alive.
        unsafe { copy_from_host(self.ptr.offset(offset), buf) };
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PhysError::WrongState("page is locked read-only"));
        }
        self.check(offset, data.len())?;
        // SAFETY: as in `read`; the page has private backing since it was locked for writing.
        unsafe { copy_to_host(self.ptr.offset(offset), data) };
        Ok(())
    }
}

impl Drop for PageMappingLock<'_> {
    fn drop(&mut self) {
        let mut state = self.space.lock_state();
        let SpaceState { dir, mem, .. } = &mut *state;
        match dir.page_mut(self.addr) {
            Some(page) => {
                if page.unlock(self.writable) == UnlockTransition::Last {
                    if self.writable {
                        mem.write_locked_pages -= 1;
                    } else {
                        mem.read_locked_pages -= 1;
                    }
                }
            }
            None => warn!(addr = self.addr, "locked page disappeared before unlock"),
        }
        if let Some(chunk) = self.chunk {
            mem.chunks.release(chunk);
        }
    }
}
