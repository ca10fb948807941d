//! Per-page descriptors.
//!
//! A [`PageDescriptor`] records what backs one guest-physical page. The host backing (allocator
//! page id + host-physical address) is only present for `Allocated`, `WriteMonitored` and
//! `Shared` pages; the state transition methods are the only way to change it, which keeps a
//! `Zero` page from ever carrying a private backing id.

use bitflags::bitflags;

/// Number of lock references after which a page mapping becomes permanent.
pub const MAX_PAGE_LOCKS: u8 = 254;

/// Opaque host allocator page identifier.
///
/// The high bits select the [`ChunkId`] the page lives in; the low `chunk_shift` bits are the
/// page index within that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

/// Host allocator chunk identifier; the unit mapped by the chunk mapping cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

impl PageId {
    #[inline]
    pub fn chunk(self, chunk_shift: u32) -> ChunkId {
        ChunkId(self.0 >> chunk_shift)
    }

    #[inline]
    pub fn index_in_chunk(self, chunk_shift: u32) -> u32 {
        self.0 & ((1u32 << chunk_shift) - 1)
    }
}

/// Host backing of an allocated page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBacking {
    pub page_id: PageId,
    pub host_phys: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Ram,
    Mmio,
    Mmio2,
    Mmio2AliasMmio,
    Rom,
    RomShadow,
    SpecialAliasMmio,
}

impl PageKind {
    /// MMIO pages have no RAM behind them; accesses always go to a handler.
    #[inline]
    pub fn is_mmio(self) -> bool {
        matches!(
            self,
            PageKind::Mmio | PageKind::Mmio2AliasMmio | PageKind::SpecialAliasMmio
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    Zero,
    Allocated,
    WriteMonitored,
    Shared,
    Ballooned,
}

impl PageState {
    #[inline]
    pub fn has_backing(self) -> bool {
        matches!(
            self,
            PageState::Allocated | PageState::WriteMonitored | PageState::Shared
        )
    }
}

/// Access handler presence on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    None,
    /// A write handler that has been temporarily disarmed.
    Disabled,
    Write,
    All,
}

impl HandlerState {
    #[inline]
    pub fn traps_writes(self) -> bool {
        matches!(self, HandlerState::Write | HandlerState::All)
    }

    #[inline]
    pub fn traps_reads(self) -> bool {
        self == HandlerState::All
    }
}

bitflags! {
    /// Access rights a collaborator may grant a direct mapping of a page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockTransition {
    Counted,
    First,
    Saturated,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnlockTransition {
    Counted,
    Last,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageDescriptor {
    kind: PageKind,
    state: PageState,
    handler: HandlerState,
    backing: Option<PageBacking>,
    read_locks: u8,
    write_locks: u8,
    written_to: bool,
}

impl PageDescriptor {
    pub(crate) fn zero(kind: PageKind) -> Self {
        Self {
            kind,
            state: PageState::Zero,
            handler: HandlerState::None,
            backing: None,
            read_locks: 0,
            write_locks: 0,
            written_to: false,
        }
    }

    pub(crate) fn allocated(kind: PageKind, backing: PageBacking) -> Self {
        Self {
            state: PageState::Allocated,
            backing: Some(backing),
            ..Self::zero(kind)
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> PageKind {
        self.kind
    }

    #[inline]
    pub(crate) fn set_kind(&mut self, kind: PageKind) {
        self.kind = kind;
    }

    #[inline]
    pub(crate) fn state(&self) -> PageState {
        self.state
    }

    #[inline]
    pub(crate) fn backing(&self) -> Option<PageBacking> {
        self.backing
    }

    #[inline]
    pub(crate) fn page_id(&self) -> Option<PageId> {
        self.backing.map(|b| b.page_id)
    }

    #[inline]
    pub(crate) fn handler(&self) -> HandlerState {
        self.handler
    }

    #[inline]
    pub(crate) fn set_handler(&mut self, handler: HandlerState) {
        self.handler = handler;
    }

    #[inline]
    pub(crate) fn mark_written_to(&mut self) {
        self.written_to = true;
    }

    /// Drops the host backing and returns it; the page reads as zeros afterwards.
    pub(crate) fn set_zero(&mut self) -> Option<PageBacking> {
        self.state = PageState::Zero;
        self.backing.take()
    }

    pub(crate) fn set_ballooned(&mut self) -> Option<PageBacking> {
        self.state = PageState::Ballooned;
        self.backing.take()
    }

    /// Installs new host backing. `state` must be one that carries backing.
    pub(crate) fn install(
        &mut self,
        state: PageState,
        backing: PageBacking,
    ) -> Option<PageBacking> {
        debug_assert!(state.has_backing());
        self.state = state;
        self.backing.replace(backing)
    }

    /// Switches between the backed states without touching the backing itself.
    pub(crate) fn set_backed_state(&mut self, state: PageState) {
        debug_assert!(state.has_backing() && self.backing.is_some());
        self.state = state;
    }

    /// Copies everything but the lock counters and handler state from `other`.
    pub(crate) fn assume_content_of(&mut self, other: &PageDescriptor) {
        self.kind = other.kind;
        self.state = other.state;
        self.backing = other.backing;
        self.written_to = other.written_to;
    }

    /// Hint for the execution manager describing how the page may be mapped directly.
    pub(crate) fn protection(&self) -> Protection {
        if self.kind.is_mmio() || self.handler.traps_reads() {
            return Protection::empty();
        }
        let read_exec = Protection::READ | Protection::EXECUTE;
        if self.handler.traps_writes() {
            return read_exec;
        }
        match self.state {
            PageState::Allocated => Protection::all(),
            PageState::Zero
            | PageState::Ballooned
            | PageState::Shared
            | PageState::WriteMonitored => read_exec,
        }
    }

    #[inline]
    pub(crate) fn read_locks(&self) -> u8 {
        self.read_locks
    }

    #[inline]
    pub(crate) fn write_locks(&self) -> u8 {
        self.write_locks
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.read_locks != 0 || self.write_locks != 0
    }

    pub(crate) fn lock(&mut self, writable: bool) -> LockTransition {
        let counter = if writable {
            &mut self.write_locks
        } else {
            &mut self.read_locks
        };
        match *counter {
            0 => {
                *counter = 1;
                LockTransition::First
            }
            MAX_PAGE_LOCKS => LockTransition::Permanent,
            c if c == MAX_PAGE_LOCKS - 1 => {
                *counter = MAX_PAGE_LOCKS;
                LockTransition::Saturated
            }
            _ => {
                *counter += 1;
                LockTransition::Counted
            }
        }
    }

    pub(crate) fn unlock(&mut self, writable: bool) -> UnlockTransition {
        let counter = if writable {
            &mut self.write_locks
        } else {
            &mut self.read_locks
        };
        match *counter {
            MAX_PAGE_LOCKS => UnlockTransition::Permanent,
            0 => UnlockTransition::Counted,
            1 => {
                *counter = 0;
                UnlockTransition::Last
            }
            _ => {
                *counter -= 1;
                UnlockTransition::Counted
            }
        }
    }

    pub(crate) fn info(&self) -> PageInfo {
        PageInfo {
            kind: self.kind,
            state: self.state,
            handler: self.handler,
            page_id: self.page_id(),
            host_phys: self.backing.map(|b| b.host_phys),
            read_locks: self.read_locks,
            write_locks: self.write_locks,
            written_to: self.written_to,
        }
    }
}

/// Snapshot of a page descriptor, the per-page unit exchanged with the persisted-state layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub kind: PageKind,
    pub state: PageState,
    pub handler: HandlerState,
    pub page_id: Option<PageId>,
    pub host_phys: Option<u64>,
    pub read_locks: u8,
    pub write_locks: u8,
    pub written_to: bool,
}
