mod common;

use aero_phys_space::{
    DeviceId, ErrorKind, HandlerState, Mmio2Flags, MmioHandler, PageKind, PhysError, RomFlags,
    PAGE_SIZE,
};

struct Nop;

impl MmioHandler for Nop {
    fn read(&mut self, _offset: u64, _size: usize) -> u64 {
        0
    }

    fn write(&mut self, _offset: u64, _size: usize, _value: u64) {}
}

#[test]
fn refused_mmio2_mapping_leaves_nothing_behind() {
    let h = common::strict_harness();
    let handle = h
        .space
        .register_mmio2(DeviceId(1), 0, 0, 4 * PAGE_SIZE, Mmio2Flags::TRACK_DIRTY_PAGES, "fb")
        .unwrap();
    h.space.write_mmio2(handle, 0, b"keep").unwrap();
    let stats = h.space.stats();

    h.exec.refuse(Some(PageKind::Mmio2));
    let err = h.space.map_mmio2(handle, 0x100_0000).unwrap_err();
    assert!(matches!(err, PhysError::ExecutionManager(_)));
    assert_eq!(err.kind(), ErrorKind::Collaborator);
    assert_eq!(h.space.mmio2_mapping_address(handle), None);
    assert!(h.space.regions().is_empty());
    assert_eq!(h.space.stats(), stats);
    assert_eq!(h.space.read_u8(0x100_0000).unwrap(), 0xFF);

    // The chunks are floating again and the dirty handlers are gone, so a retry works.
    h.exec.refuse(None);
    h.space.map_mmio2(handle, 0x100_0000).unwrap();
    let mut buf = [0u8; 4];
    h.space.read(0x100_0000, &mut buf).unwrap();
    assert_eq!(&buf, b"keep");
    assert_eq!(
        h.space.page_info(0x100_0000).unwrap().handler,
        HandlerState::Write
    );
}

#[test]
fn refused_mmio2_overlay_restores_the_ram_pages() {
    let h = common::strict_harness();
    h.space.register_ram(0, 0x10_0000, "ram").unwrap();
    h.space.write_u32(0x8000, 0xdead_beef).unwrap();
    let handle = h
        .space
        .register_mmio2(DeviceId(2), 0, 0, 2 * PAGE_SIZE, Mmio2Flags::empty(), "shadow fb")
        .unwrap();
    let outstanding = h.alloc.outstanding_pages();
    let stats = h.space.stats();
    let page = h.space.page_info(0x8000);

    h.exec.refuse(Some(PageKind::Mmio2));
    assert!(matches!(
        h.space.map_mmio2(handle, 0x8000),
        Err(PhysError::ExecutionManager(_))
    ));
    assert_eq!(h.space.page_info(0x8000), page);
    assert_eq!(h.space.read_u32(0x8000).unwrap(), 0xdead_beef);
    assert_eq!(h.space.stats(), stats);
    assert_eq!(h.alloc.outstanding_pages(), outstanding);
    assert_eq!(h.space.mmio2_mapping_address(handle), None);

    h.exec.refuse(None);
    h.space.map_mmio2(handle, 0x8000).unwrap();
    assert_eq!(h.space.page_info(0x8000).unwrap().kind, PageKind::Mmio2);
    assert_eq!(h.alloc.outstanding_pages(), outstanding - 1);
}

#[test]
fn refused_unmap_keeps_the_mapping() {
    let h = common::strict_harness();
    let handle = h
        .space
        .register_mmio2(DeviceId(1), 0, 0, 4 * PAGE_SIZE, Mmio2Flags::empty(), "bar")
        .unwrap();
    h.space.map_mmio2(handle, 0x100_0000).unwrap();
    h.space.write_u32(0x100_2000, 0x600d_f00d).unwrap();
    let regions = h.space.regions();

    h.exec.refuse(Some(PageKind::Mmio2));
    assert!(matches!(
        h.space.unmap_mmio2(handle),
        Err(PhysError::ExecutionManager(_))
    ));
    assert_eq!(h.space.mmio2_mapping_address(handle), Some(0x100_0000));
    assert_eq!(h.space.regions(), regions);
    assert_eq!(h.space.read_u32(0x100_2000).unwrap(), 0x600d_f00d);

    h.exec.refuse(None);
    h.space.unmap_mmio2(handle).unwrap();
    assert!(h.space.regions().is_empty());
}

#[test]
fn refused_mmio_overlay_keeps_the_ram() {
    let h = common::strict_harness();
    h.space.register_ram(0, 16 * PAGE_SIZE, "ram").unwrap();
    h.space.write_u8(0x3000, 0x42).unwrap();
    let stats = h.space.stats();

    h.exec.refuse(Some(PageKind::Mmio));
    assert!(matches!(
        h.space.register_mmio(0x3000, PAGE_SIZE, Box::new(Nop), "dev"),
        Err(PhysError::ExecutionManager(_))
    ));
    let page = h.space.page_info(0x3000).unwrap();
    assert_eq!(page.kind, PageKind::Ram);
    assert_eq!(page.handler, HandlerState::None);
    assert_eq!(h.space.read_u8(0x3000).unwrap(), 0x42);
    assert_eq!(h.space.stats(), stats);

    // The access handler was withdrawn as well.
    h.exec.refuse(None);
    h.space
        .register_mmio(0x3000, PAGE_SIZE, Box::new(Nop), "dev")
        .unwrap();
    assert_eq!(h.space.page_info(0x3000).unwrap().kind, PageKind::Mmio);
}

#[test]
fn refused_removal_of_ad_hoc_mmio_keeps_the_region() {
    let h = common::strict_harness();
    h.space
        .register_mmio(0xfee0_0000, PAGE_SIZE, Box::new(Nop), "apic")
        .unwrap();
    let regions = h.space.regions();

    h.exec.refuse(Some(PageKind::Mmio));
    assert!(matches!(
        h.space.deregister_mmio(0xfee0_0000, PAGE_SIZE),
        Err(PhysError::ExecutionManager(_))
    ));
    assert_eq!(h.space.regions(), regions);
    assert_eq!(
        h.space.page_info(0xfee0_0000).unwrap().handler,
        HandlerState::All
    );

    h.exec.refuse(None);
    h.space.deregister_mmio(0xfee0_0000, PAGE_SIZE).unwrap();
    assert!(h.space.regions().is_empty());
}

#[test]
fn refused_rom_over_ram_frees_its_image_pages() {
    let h = common::strict_harness();
    h.space.register_ram(0, 0x10_0000, "ram").unwrap();
    h.space.write_u8(0xc_0000, 0x11).unwrap();
    let outstanding = h.alloc.outstanding_pages();
    let regions = h.space.regions();

    h.exec.refuse(Some(PageKind::Rom));
    assert!(matches!(
        h.space
            .register_rom(0xc_0000, 0x2000, &[0x55, 0xAA], RomFlags::SHADOWED, "vga bios"),
        Err(PhysError::ExecutionManager(_))
    ));
    assert_eq!(h.alloc.outstanding_pages(), outstanding);
    assert_eq!(h.space.regions(), regions);
    assert_eq!(h.space.stats().rom_overlays, 0);
    assert_eq!(h.space.page_info(0xc_0000).unwrap().kind, PageKind::Ram);
    assert_eq!(h.space.read_u8(0xc_0000).unwrap(), 0x11);

    h.exec.refuse(None);
    h.space
        .register_rom(0xc_0000, 0x2000, &[0x55, 0xAA], RomFlags::SHADOWED, "vga bios")
        .unwrap();
    assert_eq!(h.space.read_u8(0xc_0000).unwrap(), 0x55);
}

#[test]
fn optional_execution_manager_failures_do_not_fail_the_caller() {
    let h = common::harness();
    let handle = h
        .space
        .register_mmio2(DeviceId(1), 0, 0, PAGE_SIZE, Mmio2Flags::empty(), "bar")
        .unwrap();
    h.exec.refuse(Some(PageKind::Mmio2));
    h.space.map_mmio2(handle, 0x100_0000).unwrap();
    assert_eq!(h.space.mmio2_mapping_address(handle), Some(0x100_0000));
    assert!(h.exec.mapped.lock().unwrap().is_empty());
}
