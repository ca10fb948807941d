//! Guest-physical reads and writes.
//!
//! Accesses are split at page boundaries. Each page piece is resolved under the address-space
//! lock; MMIO callbacks run after it has been released.

use std::ops::Range;
use std::sync::{Arc, PoisonError};

use tracing::trace;

use crate::error::{PhysError, Result};
use crate::handler::{HandlerKind, SharedMmioHandler};
use crate::page::HandlerState;
use crate::rom::{rom_page_mut, RomWrite};
use crate::space::{copy_from_host, copy_to_host, Flow, PhysAddressSpace, SpaceState};
use crate::PAGE_SIZE;

/// Value returned for reads that hit no device or memory.
const OPEN_BUS: u8 = 0xFF;

enum Step {
    Done,
    Mmio {
        handler: SharedMmioHandler,
        offset: u64,
    },
}

/// Largest naturally aligned access size that fits in `remaining` bytes at `offset`.
fn piece_size(offset: u64, remaining: usize) -> usize {
    [8usize, 4, 2, 1]
        .into_iter()
        .find(|&size| size <= remaining && offset % size as u64 == 0)
        .unwrap_or(1)
}

fn mmio_read(handler: &SharedMmioHandler, offset: u64, buf: &mut [u8]) {
    let mut dev = handler.lock().unwrap_or_else(PoisonError::into_inner);
    let mut done = 0;
    while done < buf.len() {
        let size = piece_size(offset + done as u64, buf.len() - done);
        let value = dev.read(offset + done as u64, size);
        buf[done..done + size].copy_from_slice(&value.to_le_bytes()[..size]);
        done += size;
    }
}

fn mmio_write(handler: &SharedMmioHandler, offset: u64, data: &[u8]) {
    let mut dev = handler.lock().unwrap_or_else(PoisonError::into_inner);
    let mut done = 0;
    while done < data.len() {
        let size = piece_size(offset + done as u64, data.len() - done);
        let mut bytes = [0u8; 8];
        bytes[..size].copy_from_slice(&data[done..done + size]);
        dev.write(offset + done as u64, size, u64::from_le_bytes(bytes));
        done += size;
    }
}

fn mmio_target(state: &SpaceState, addr: u64) -> Option<Step> {
    let handler = state.handlers.find(addr)?;
    match &handler.kind {
        HandlerKind::Mmio(dev) => Some(Step::Mmio {
            handler: Arc::clone(dev),
            offset: addr - handler.base,
        }),
        _ => None,
    }
}

/// Walks `addr..addr + len` in page-bounded pieces.
fn for_each_piece(
    addr: u64,
    len: usize,
    mut f: impl FnMut(u64, Range<usize>) -> Result<()>,
) -> Result<()> {
    let mut done = 0usize;
    while done < len {
        let pos = addr.wrapping_add(done as u64);
        let in_page = (pos & (PAGE_SIZE - 1)) as usize;
        let chunk = (PAGE_SIZE as usize - in_page).min(len - done);
        f(pos, done..done + chunk)?;
        done += chunk;
    }
    Ok(())
}

impl PhysAddressSpace {
    /// Reads guest-physical memory. Unmapped addresses read as `0xFF`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if addr.checked_add(buf.len() as u64).is_none() {
            return Err(PhysError::InvalidParameter("access wraps the address space"));
        }
        for_each_piece(addr, buf.len(), |pos, range| {
            let page_addr = pos & !(PAGE_SIZE - 1);
            let in_page = (pos - page_addr) as usize;
            let step = self.locked(|state| {
                let Some(page) = state.dir.page(pos) else {
                    buf[range.clone()].fill(OPEN_BUS);
                    return Ok(Step::Done);
                };
                if page.handler() == HandlerState::All {
                    if let Some(step) = mmio_target(state, pos) {
                        return Ok(step);
                    }
                }
                if page.kind().is_mmio() {
                    buf[range.clone()].fill(OPEN_BUS);
                    return Ok(Step::Done);
                }
                let SpaceState { dir, mem, .. } = state;
                let Some(page) = dir.page(pos) else {
                    return Ok(Step::Done);
                };
                let ptr = self.page_ptr(mem, page, page_addr)?;
                // SAFETY: the piece stays inside the page and the lock is held for the copy.
                unsafe { copy_from_host(ptr.offset(in_page), &mut buf[range.clone()]) };
                Ok(Step::Done)
            })?;
            if let Step::Mmio { handler, offset } = step {
                trace!(addr = pos, len = range.len(), "MMIO read");
                mmio_read(&handler, offset, &mut buf[range]);
            }
            Ok(())
        })
    }

    /// Writes guest-physical memory. Writes to unmapped addresses and write-protected ROM are
    /// dropped.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        if addr.checked_add(data.len() as u64).is_none() {
            return Err(PhysError::InvalidParameter("access wraps the address space"));
        }
        for_each_piece(addr, data.len(), |pos, range| {
            let step = self.locked(|state| self.write_piece(state, pos, &data[range.clone()]))?;
            if let Step::Mmio { handler, offset } = step {
                trace!(addr = pos, len = range.len(), "MMIO write");
                mmio_write(&handler, offset, &data[range]);
            }
            Ok(())
        })
    }

    fn write_piece(&self, state: &mut SpaceState, pos: u64, data: &[u8]) -> Flow<Step> {
        let page_addr = pos & !(PAGE_SIZE - 1);
        let in_page = (pos - page_addr) as usize;
        let Some(page) = state.dir.page(pos) else {
            return Ok(Step::Done);
        };
        let handler = page.handler();
        let kind = page.kind();

        match handler {
            HandlerState::All => return Ok(mmio_target(state, pos).unwrap_or(Step::Done)),
            HandlerState::Write => {
                let target = state.handlers.find(pos).map(|h| h.kind.clone());
                match target {
                    Some(HandlerKind::Rom) => {
                        let SpaceState { roms, mem, .. } = state;
                        let Some(rom) = rom_page_mut(roms, pos) else {
                            return Ok(Step::Done);
                        };
                        if rom.write_target() == RomWrite::Ignore {
                            return Ok(Step::Done);
                        }
                        let Some(shadow) = rom.stored_shadow_mut() else {
                            return Ok(Step::Done);
                        };
                        self.make_writable(mem, shadow, None)?;
                        let Some(backing) = shadow.backing() else {
                            return Ok(Step::Done);
                        };
                        let ptr = self.backing_ptr(mem, None, backing)?;
                        // SAFETY: the piece stays inside the page and the lock is held.
                        unsafe { copy_to_host(ptr.offset(in_page), data) };
                        return Ok(Step::Done);
                    }
                    Some(HandlerKind::Mmio2Dirty(handle)) => {
                        if let Some(reg) = state.mmio2.get_mut(&handle.id()) {
                            reg.mark_dirty(pos);
                        }
                        if let Some(page) = state.dir.page_mut(pos) {
                            page.set_handler(HandlerState::Disabled);
                        }
                        state.mem.tlb.invalidate(page_addr);
                        self.pool_invalidate(page_addr);
                    }
                    Some(HandlerKind::Mmio(_)) => {
                        return Ok(mmio_target(state, pos).unwrap_or(Step::Done));
                    }
                    None => {}
                }
            }
            HandlerState::None | HandlerState::Disabled => {}
        }

        if kind.is_mmio() {
            return Ok(Step::Done);
        }
        let SpaceState { dir, mem, .. } = state;
        let Some(page) = dir.page_mut(pos) else {
            return Ok(Step::Done);
        };
        self.make_writable(mem, page, Some(page_addr))?;
        let ptr = self.page_ptr(mem, page, page_addr)?;
        // SAFETY: the page has private backing in a mapped chunk, the piece stays inside it and
        // the lock is held for the copy.
        unsafe { copy_to_host(ptr.offset(in_page), data) };
        Ok(Step::Done)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}
