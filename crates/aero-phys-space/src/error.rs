use thiserror::Error;

use crate::page::PageKind;

pub type Result<T> = std::result::Result<T, PhysError>;

/// Failure reported by a collaborator (host allocator or execution manager).
///
/// Stored as owned data so that implementations backed by a kernel driver, a hypervisor API or a
/// plain heap can all surface their failures without a platform-specific error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host allocator is out of memory")]
    OutOfMemory,

    #[error("page reservation of {requested} pages exceeds the host limit")]
    ReservationExceeded { requested: u64 },

    #[error("unknown chunk {0}")]
    UnknownChunk(u32),

    #[error("unknown page id {0:#x}")]
    UnknownPage(u32),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`PhysError`] values.
///
/// Hot-path callers use this to choose between falling back to the mediated access path and
/// failing outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    ResourceExhaustion,
    ReservedPage,
    NoEvictableChunk,
    InvalidInput,
    NotFound,
    WrongState,
    Collaborator,
}

#[derive(Debug, Error)]
pub enum PhysError {
    #[error("range {base:#x}..={last:#x} conflicts with region {existing_base:#x}..={existing_last:#x} ({existing_tag})")]
    Conflict {
        base: u64,
        last: u64,
        existing_base: u64,
        existing_last: u64,
        existing_tag: String,
    },

    #[error("range {base:#x}..={last:#x} conflicts with access handler {existing_base:#x}..={existing_last:#x} ({existing_tag})")]
    HandlerConflict {
        base: u64,
        last: u64,
        existing_base: u64,
        existing_last: u64,
        existing_tag: String,
    },

    #[error("page {addr:#x} has kind {kind:?} which cannot be replaced by this overlay")]
    WrongPageKind { addr: u64, kind: PageKind },

    #[error("address or size {value:#x} is not page aligned")]
    Unaligned { value: u64 },

    #[error("range at {base:#x} with size {size:#x} is empty or wraps the address space")]
    InvalidRange { base: u64, size: u64 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("host resource exhausted: {0}")]
    ResourceExhausted(#[source] HostError),

    #[error("host allocator failure: {0}")]
    Host(#[source] HostError),

    #[error("page {addr:#x} is reserved (active access handlers or MMIO backing)")]
    ReservedPage { addr: u64 },

    #[error("chunk mapping cache is full ({mapped} chunks) and every entry is referenced")]
    NoEvictableChunk { mapped: usize },

    #[error("no region covers guest-physical address {addr:#x}")]
    NotMapped { addr: u64 },

    #[error("no registration matches {0}")]
    NotFound(&'static str),

    #[error("MMIO2 handle {0} is not registered")]
    InvalidMmio2Handle(u32),

    #[error("operation not valid in the current state: {0}")]
    WrongState(&'static str),

    #[error("MMIO2 registration limit reached ({limit} chunks)")]
    TooManyMmio2Chunks { limit: usize },

    #[error("execution manager rejected the change: {0}")]
    ExecutionManager(#[source] HostError),
}

impl PhysError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PhysError::Conflict { .. }
            | PhysError::HandlerConflict { .. }
            | PhysError::WrongPageKind { .. } => ErrorKind::Conflict,
            PhysError::ResourceExhausted(_) | PhysError::TooManyMmio2Chunks { .. } => {
                ErrorKind::ResourceExhaustion
            }
            PhysError::ReservedPage { .. } => ErrorKind::ReservedPage,
            PhysError::NoEvictableChunk { .. } => ErrorKind::NoEvictableChunk,
            PhysError::Unaligned { .. }
            | PhysError::InvalidRange { .. }
            | PhysError::InvalidParameter(_)
            | PhysError::InvalidConfig(_) => ErrorKind::InvalidInput,
            PhysError::NotMapped { .. }
            | PhysError::NotFound(_)
            | PhysError::InvalidMmio2Handle(_) => ErrorKind::NotFound,
            PhysError::WrongState(_) => ErrorKind::WrongState,
            PhysError::Host(_) | PhysError::ExecutionManager(_) => ErrorKind::Collaborator,
        }
    }
}

impl From<HostError> for PhysError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::OutOfMemory | HostError::ReservationExceeded { .. } => {
                PhysError::ResourceExhausted(err)
            }
            other => PhysError::Host(other),
        }
    }
}
