use crate::error::{PhysError, Result};

/// Tunables for a [`crate::PhysAddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysSpaceOptions {
    /// Maximum number of chunks mapped into the process at once.
    pub max_mapped_chunks: usize,
    /// Largest number of pages in one MMIO2 chunk region.
    pub max_mmio2_chunk_pages: u64,
    /// Largest number of pages in one MMIO2 registration.
    pub max_mmio2_pages: u64,
    /// Maximum number of MMIO2 chunks registered at once.
    pub max_mmio2_chunks: usize,
    /// Pages queued before a batch is handed to the host allocator's `free_pages`.
    pub free_batch_size: usize,
    /// Size of the pre-allocated page reserve used on first-touch faults.
    pub handy_pages: usize,
    /// A background refill is requested once the reserve drops to this many pages.
    pub handy_refill_threshold: usize,
    /// Allocate RAM backing at registration time instead of on first write.
    pub preallocate_ram: bool,
    /// Treat execution manager notification failures as fatal.
    pub execution_manager_mandatory: bool,
}

impl PhysSpaceOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_mapped_chunks == 0 {
            return Err(PhysError::InvalidConfig("max_mapped_chunks must be non-zero"));
        }
        if self.max_mmio2_chunk_pages == 0 {
            return Err(PhysError::InvalidConfig(
                "max_mmio2_chunk_pages must be non-zero",
            ));
        }
        if self.max_mmio2_pages < self.max_mmio2_chunk_pages {
            return Err(PhysError::InvalidConfig(
                "max_mmio2_pages must be at least max_mmio2_chunk_pages",
            ));
        }
        if self.free_batch_size == 0 {
            return Err(PhysError::InvalidConfig("free_batch_size must be non-zero"));
        }
        if self.handy_refill_threshold > self.handy_pages {
            return Err(PhysError::InvalidConfig(
                "handy_refill_threshold must not exceed handy_pages",
            ));
        }
        Ok(())
    }
}

impl Default for PhysSpaceOptions {
    fn default() -> Self {
        Self {
            max_mapped_chunks: 1024,
            // 16 MiB per chunk.
            max_mmio2_chunk_pages: 4096,
            max_mmio2_pages: 0x0100_0000,
            max_mmio2_chunks: 32,
            free_batch_size: 128,
            handy_pages: 128,
            handy_refill_threshold: 32,
            preallocate_ram: false,
            execution_manager_mandatory: false,
        }
    }
}
