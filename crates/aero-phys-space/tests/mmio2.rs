mod common;

use aero_phys_space::{
    DeviceId, ErrorKind, HandlerState, HeapAllocator, Mmio2Flags, PageKind, PageState,
    PhysError, PhysSpaceOptions, RegionFlags, PAGE_SIZE,
};

const CHUNK_PAGES: u64 = 4;

fn options() -> PhysSpaceOptions {
    PhysSpaceOptions {
        max_mmio2_chunk_pages: CHUNK_PAGES,
        max_mmio2_pages: 64,
        max_mmio2_chunks: 8,
        ..PhysSpaceOptions::default()
    }
}

fn harness() -> common::Harness {
    common::harness_with(options())
}

fn page_ids(h: &common::Harness, base: u64, pages: u64) -> Vec<u32> {
    (0..pages)
        .map(|i| {
            h.space
                .page_info(base + i * PAGE_SIZE)
                .and_then(|p| p.page_id)
                .unwrap()
                .0
        })
        .collect()
}

#[test]
fn two_chunk_region_maps_without_a_seam() {
    let h = harness();
    let size = 2 * CHUNK_PAGES * PAGE_SIZE;
    let handle = h
        .space
        .register_mmio2(DeviceId(3), 0, 0, size, Mmio2Flags::empty(), "fb")
        .unwrap();
    assert_eq!(h.space.mmio2_info(handle).unwrap().chunk_count, 2);
    assert!(h.space.regions().is_empty());

    let base = 0xe000_0000;
    h.space.map_mmio2(handle, base).unwrap();
    let regions = h.space.regions();
    assert_eq!(regions.len(), 2);
    for region in &regions {
        assert!(region.flags.contains(RegionFlags::MMIO2_CHUNK));
        assert!(!region.flags.contains(RegionFlags::FLOATING));
    }
    assert_eq!(regions[0].base, base);
    assert_eq!(regions[1].base, regions[0].last + 1);
    assert_eq!(regions[1].last, base + size - 1);

    let seam = base + CHUNK_PAGES * PAGE_SIZE;
    h.space.write(seam - 2, &[1, 2, 3, 4]).unwrap();
    let mut buf = [0u8; 4];
    h.space.read(seam - 2, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);

    let mut dev = [0u8; 4];
    h.space
        .read_mmio2(handle, CHUNK_PAGES * PAGE_SIZE - 2, &mut dev)
        .unwrap();
    assert_eq!(dev, [1, 2, 3, 4]);
    assert_eq!(h.space.mmio2_mapping_address(handle), Some(base));
}

#[test]
fn remapping_keeps_backing_and_content() {
    let h = harness();
    let pages = 6;
    let handle = h
        .space
        .register_mmio2(DeviceId(1), 0, 2, pages * PAGE_SIZE, Mmio2Flags::empty(), "bar2")
        .unwrap();
    h.space.write_mmio2(handle, 0x10, b"aero").unwrap();

    h.space.map_mmio2(handle, 0x8000_0000).unwrap();
    let first = page_ids(&h, 0x8000_0000, pages);
    h.space.unmap_mmio2(handle).unwrap();
    assert_eq!(h.space.mmio2_mapping_address(handle), None);
    assert!(h.space.regions().is_empty());

    h.space.map_mmio2(handle, 0x9000_0000).unwrap();
    assert_eq!(page_ids(&h, 0x9000_0000, pages), first);
    let mut buf = [0u8; 4];
    h.space.read(0x9000_0010, &mut buf).unwrap();
    assert_eq!(&buf, b"aero");
}

#[test]
fn mapping_over_ram_borrows_the_ram_pages() {
    let h = harness();
    h.space.register_ram(0, 0x10_0000, "ram").unwrap();
    h.space.write_u32(0x8000, 0xdead_beef).unwrap();
    let outstanding = h.alloc.outstanding_pages();

    let handle = h
        .space
        .register_mmio2(DeviceId(2), 0, 0, 2 * PAGE_SIZE, Mmio2Flags::empty(), "shadow fb")
        .unwrap();
    h.space.write_mmio2(handle, 0, &[0xAA; 4]).unwrap();
    h.space.map_mmio2(handle, 0x8000).unwrap();

    assert_eq!(h.space.regions().len(), 1);
    let page = h.space.page_info(0x8000).unwrap();
    assert_eq!(page.kind, PageKind::Mmio2);
    assert_eq!(page.state, PageState::Allocated);
    assert_eq!(h.space.read_u32(0x8000).unwrap(), 0xaaaa_aaaa);
    assert!(h.space.mmio2_info(handle).unwrap().overlapping);
    // The RAM page that was replaced went back to the allocator.
    assert_eq!(h.alloc.outstanding_pages(), outstanding + 2 - 1);

    h.space.unmap_mmio2(handle).unwrap();
    let page = h.space.page_info(0x8000).unwrap();
    assert_eq!(page.kind, PageKind::Ram);
    assert_eq!(page.state, PageState::Zero);
    assert_eq!(h.space.read_u32(0x8000).unwrap(), 0);

    h.space.deregister_mmio2(handle).unwrap();
    assert_eq!(h.alloc.outstanding_pages(), outstanding - 1);
}

#[test]
fn mapping_over_non_ram_pages_is_rejected() {
    let h = harness();
    h.space.register_ram(0, 0x10_0000, "ram").unwrap();
    let a = h
        .space
        .register_mmio2(DeviceId(1), 0, 0, PAGE_SIZE, Mmio2Flags::empty(), "a")
        .unwrap();
    let b = h
        .space
        .register_mmio2(DeviceId(1), 0, 1, 2 * PAGE_SIZE, Mmio2Flags::empty(), "b")
        .unwrap();
    h.space.map_mmio2(a, 0x4000).unwrap();
    assert!(matches!(
        h.space.map_mmio2(b, 0x3000),
        Err(PhysError::WrongPageKind { addr: 0x4000, kind: PageKind::Mmio2 })
    ));
    assert_eq!(h.space.mmio2_mapping_address(b), None);
    assert!(matches!(
        h.space.map_mmio2(a, 0x8000),
        Err(PhysError::WrongState(_))
    ));
}

#[test]
fn registration_limits_are_enforced() {
    let h = harness();
    assert!(matches!(
        h.space
            .register_mmio2(DeviceId(1), 0, 0, 65 * PAGE_SIZE, Mmio2Flags::empty(), "huge"),
        Err(PhysError::InvalidParameter(_))
    ));
    let chunk = CHUNK_PAGES * PAGE_SIZE;
    h.space
        .register_mmio2(DeviceId(1), 0, 0, 7 * chunk, Mmio2Flags::empty(), "big")
        .unwrap();
    assert!(matches!(
        h.space
            .register_mmio2(DeviceId(1), 0, 1, 2 * chunk, Mmio2Flags::empty(), "x"),
        Err(PhysError::TooManyMmio2Chunks { limit: 8 })
    ));
    assert!(matches!(
        h.space
            .register_mmio2(DeviceId(1), 0, 0, PAGE_SIZE, Mmio2Flags::empty(), "dup"),
        Err(PhysError::WrongState(_))
    ));
}

#[test]
fn dirty_tracking_records_guest_writes() {
    let h = harness();
    let handle = h
        .space
        .register_mmio2(DeviceId(7), 0, 0, 4 * PAGE_SIZE, Mmio2Flags::TRACK_DIRTY_PAGES, "vga")
        .unwrap();
    let base = 0xa000_0000;
    h.space.map_mmio2(handle, base).unwrap();
    assert_eq!(
        h.space.page_info(base).unwrap().handler,
        HandlerState::Write
    );
    assert_eq!(h.space.query_and_reset_mmio2_dirty_bitmap(handle).unwrap(), vec![0]);

    h.space.write_u8(base + 2 * PAGE_SIZE + 5, 9).unwrap();
    assert_eq!(
        h.space.page_info(base + 2 * PAGE_SIZE).unwrap().handler,
        HandlerState::Disabled
    );
    // Device-side writes are not guest writes.
    h.space.write_mmio2(handle, 0, &[1]).unwrap();
    assert_eq!(
        h.space.query_and_reset_mmio2_dirty_bitmap(handle).unwrap(),
        vec![0b100]
    );
    assert_eq!(
        h.space.page_info(base + 2 * PAGE_SIZE).unwrap().handler,
        HandlerState::Write
    );
    assert_eq!(h.space.query_and_reset_mmio2_dirty_bitmap(handle).unwrap(), vec![0]);
    assert_eq!(h.space.read_u8(base + 2 * PAGE_SIZE + 5).unwrap(), 9);

    h.space.control_mmio2_dirty_tracking(handle, false).unwrap();
    assert_eq!(h.space.page_info(base).unwrap().handler, HandlerState::None);
    assert_eq!(
        h.space.query_and_reset_mmio2_dirty_bitmap(handle).unwrap(),
        vec![0b1111]
    );
    h.space.control_mmio2_dirty_tracking(handle, true).unwrap();
    assert_eq!(h.space.page_info(base).unwrap().handler, HandlerState::Write);
}

#[test]
fn untracked_regions_reject_dirty_queries() {
    let h = harness();
    let handle = h
        .space
        .register_mmio2(DeviceId(1), 0, 0, PAGE_SIZE, Mmio2Flags::empty(), "plain")
        .unwrap();
    assert!(matches!(
        h.space.query_and_reset_mmio2_dirty_bitmap(handle),
        Err(PhysError::WrongState(_))
    ));
    h.space.deregister_mmio2(handle).unwrap();
    assert!(matches!(
        h.space.map_mmio2(handle, 0x1000),
        Err(PhysError::InvalidMmio2Handle(_))
    ));
}

#[test]
fn registration_without_host_memory_changes_nothing() {
    let h = common::harness_on(
        HeapAllocator::with_page_limit(common::CHUNK_SHIFT, 6),
        PhysSpaceOptions {
            execution_manager_mandatory: true,
            ..options()
        },
    );
    let first = h
        .space
        .register_mmio2(DeviceId(1), 0, 0, CHUNK_PAGES * PAGE_SIZE, Mmio2Flags::empty(), "a")
        .unwrap();
    h.space.map_mmio2(first, 0x100_0000).unwrap();
    let regions = h.space.regions();
    let stats = h.space.stats();
    let outstanding = h.alloc.outstanding_pages();

    let err = h
        .space
        .register_mmio2(DeviceId(2), 0, 0, CHUNK_PAGES * PAGE_SIZE, Mmio2Flags::empty(), "b")
        .unwrap_err();
    assert!(matches!(err, PhysError::ResourceExhausted(_)));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert_eq!(h.space.regions(), regions);
    assert_eq!(h.space.stats(), stats);
    assert_eq!(h.space.stats().mmio2_registrations, 1);
    assert_eq!(h.alloc.outstanding_pages(), outstanding);

    // Whatever fits under the limit can still be registered.
    h.space
        .register_mmio2(DeviceId(2), 0, 0, 2 * PAGE_SIZE, Mmio2Flags::empty(), "b")
        .unwrap();
    assert_eq!(h.alloc.outstanding_pages(), 6);
}
