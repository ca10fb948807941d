//! Shared helpers for `aero-phys-space` integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use aero_phys_space::{
    ExecutionManager, HeapAllocator, HostError, PageChange, PageKind, PageTablePool,
    PhysAddressSpace, PhysSpaceOptions, RegionEvent,
};

pub const CHUNK_SHIFT: u32 = 2;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Page-table pool that counts what it was asked to drop.
#[derive(Debug, Default)]
pub struct RecordingPool {
    pub invalidated: Mutex<Vec<u64>>,
    pub clears: Mutex<u64>,
}

impl RecordingPool {
    pub fn invalidations(&self) -> usize {
        self.invalidated.lock().unwrap().len()
    }

    pub fn clear_count(&self) -> u64 {
        *self.clears.lock().unwrap()
    }
}

impl PageTablePool for RecordingPool {
    fn invalidate_page(&self, addr: u64) {
        self.invalidated.lock().unwrap().push(addr);
    }

    fn clear_all(&self) {
        *self.clears.lock().unwrap() += 1;
    }
}

/// Execution manager that records accepted notifications and can refuse one page kind.
#[derive(Debug, Default)]
pub struct RecordingExec {
    pub pages: Mutex<Vec<PageChange>>,
    pub mapped: Mutex<Vec<RegionEvent>>,
    pub unmapped: Mutex<Vec<RegionEvent>>,
    refused: Mutex<Option<PageKind>>,
}

impl RecordingExec {
    /// Refuses every page and region notification of `kind` until called again with `None`.
    pub fn refuse(&self, kind: Option<PageKind>) {
        *self.refused.lock().unwrap() = kind;
    }

    fn check(&self, kind: PageKind) -> Result<(), HostError> {
        if *self.refused.lock().unwrap() == Some(kind) {
            return Err(HostError::Other(format!("{kind:?} refused")));
        }
        Ok(())
    }
}

impl ExecutionManager for RecordingExec {
    fn notify_page_changed(&self, change: &PageChange) -> Result<(), HostError> {
        self.check(change.kind)?;
        self.pages.lock().unwrap().push(*change);
        Ok(())
    }

    fn notify_region_mapped(&self, event: &RegionEvent) -> Result<(), HostError> {
        self.check(event.kind)?;
        self.mapped.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn notify_region_unmapped(&self, event: &RegionEvent) -> Result<(), HostError> {
        self.check(event.kind)?;
        self.unmapped.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub space: PhysAddressSpace,
    pub alloc: Arc<HeapAllocator>,
    pub pool: Arc<RecordingPool>,
    pub exec: Arc<RecordingExec>,
}

pub fn harness_with(options: PhysSpaceOptions) -> Harness {
    harness_on(HeapAllocator::new(CHUNK_SHIFT), options)
}

pub fn harness_on(alloc: HeapAllocator, options: PhysSpaceOptions) -> Harness {
    init_tracing();
    let alloc = Arc::new(alloc);
    let pool = Arc::new(RecordingPool::default());
    let exec = Arc::new(RecordingExec::default());
    let space = PhysAddressSpace::new(alloc.clone(), options)
        .unwrap()
        .with_page_table_pool(pool.clone())
        .with_execution_manager(exec.clone());
    Harness {
        space,
        alloc,
        pool,
        exec,
    }
}

pub fn harness() -> Harness {
    harness_with(PhysSpaceOptions::default())
}

/// Harness whose execution manager failures are fatal.
pub fn strict_harness() -> Harness {
    harness_with(PhysSpaceOptions {
        execution_manager_mandatory: true,
        ..PhysSpaceOptions::default()
    })
}
