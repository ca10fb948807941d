//! Physical access handlers.
//!
//! Handlers cover page-aligned ranges and never overlap. The pages under a handler carry a
//! [`crate::HandlerState`] so the access paths know which accesses to divert without consulting
//! the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{PhysError, Result};
use crate::mmio2::Mmio2Handle;

/// Device callback for MMIO ranges.
///
/// `offset` is relative to the start of the registered range and `size` is 1, 2, 4 or 8.
pub trait MmioHandler: Send {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

pub(crate) type SharedMmioHandler = Arc<Mutex<Box<dyn MmioHandler>>>;

#[derive(Clone)]
pub(crate) enum HandlerKind {
    Mmio(SharedMmioHandler),
    Rom,
    Mmio2Dirty(Mmio2Handle),
}

impl fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Mmio(_) => f.write_str("Mmio"),
            HandlerKind::Rom => f.write_str("Rom"),
            HandlerKind::Mmio2Dirty(handle) => f.debug_tuple("Mmio2Dirty").field(handle).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PhysHandler {
    pub(crate) base: u64,
    pub(crate) last: u64,
    pub(crate) kind: HandlerKind,
    pub(crate) tag: Arc<str>,
}

#[derive(Debug, Default)]
pub(crate) struct HandlerRegistry {
    handlers: BTreeMap<u64, PhysHandler>,
}

impl HandlerRegistry {
    pub(crate) fn find(&self, addr: u64) -> Option<&PhysHandler> {
        self.handlers
            .range(..=addr)
            .next_back()
            .map(|(_, h)| h)
            .filter(|h| addr <= h.last)
    }

    /// Fails if any registered handler intersects `base..=last`.
    pub(crate) fn check_free(&self, base: u64, last: u64) -> Result<()> {
        match self.handlers.range(..=last).next_back() {
            Some((_, h)) if h.last >= base => Err(PhysError::HandlerConflict {
                base,
                last,
                existing_base: h.base,
                existing_last: h.last,
                existing_tag: h.tag.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn register(&mut self, handler: PhysHandler) -> Result<()> {
        self.check_free(handler.base, handler.last)?;
        self.handlers.insert(handler.base, handler);
        Ok(())
    }

    pub(crate) fn remove(&mut self, base: u64) -> Option<PhysHandler> {
        self.handlers.remove(&base)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handlers.len()
    }
}
