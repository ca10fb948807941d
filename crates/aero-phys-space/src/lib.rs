//! Guest-physical address space management.
//!
//! A VM's physical address space is a sorted set of page-aligned regions, each an array of page
//! descriptors. This crate owns that directory and everything that reshapes it:
//!
//! - [`PhysAddressSpace`]: the directory, page descriptors and host mappings under one lock
//! - RAM, MMIO, MMIO2 (device-owned RAM) and ROM registration, including overlays that carve
//!   part of an existing RAM region
//! - lazy page backing: Zero pages get memory on first write from a reserve of handy pages
//! - [`PageMappingLock`]: direct host access to a page for devices
//! - a bounded cache of host chunk mappings with eviction under a [`Rendezvous`]
//!
//! Host memory comes from a [`HostAllocator`]; [`HeapAllocator`] backs hosted builds and tests.

mod access;
mod alloc;
mod chunk_cache;
mod directory;
mod error;
mod handler;
mod host;
mod lock;
mod mmio;
mod mmio2;
mod options;
mod page;
mod ram;
mod region;
mod rendezvous;
mod rom;
mod space;
mod tlb;

pub use error::{ErrorKind, HostError, PhysError, Result};
pub use handler::MmioHandler;
pub use host::{
    ExecutionManager, HeapAllocator, HostAllocator, HostPtr, PageChange, PageTablePool,
    RegionEvent,
};
pub use lock::PageMappingLock;
pub use mmio2::{DeviceId, Mmio2Flags, Mmio2Handle, Mmio2Info};
pub use options::PhysSpaceOptions;
pub use page::{
    ChunkId, HandlerState, PageBacking, PageId, PageInfo, PageKind, PageState, Protection,
    MAX_PAGE_LOCKS,
};
pub use region::{RegionFlags, RegionInfo};
pub use rendezvous::{ParkingRendezvous, Participant, Quiesced, Rendezvous};
pub use rom::{RomFlags, RomProt};
pub use space::{PhysAddressSpace, PhysStats};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
