mod common;

use aero_phys_space::{
    ErrorKind, HandlerState, HeapAllocator, PageKind, PageState, PhysError, PhysSpaceOptions,
    RomFlags, RomProt, PAGE_SIZE,
};

const ROM_BASE: u64 = 0xc_0000;
const ROM_SIZE: u64 = 0x4000;

fn image() -> Vec<u8> {
    (0..ROM_SIZE as usize - 100).map(|i| (i % 251) as u8).collect()
}

fn vga_bios(h: &common::Harness) {
    h.space.register_ram(0, 0x10_0000, "conventional").unwrap();
    h.space
        .register_rom(ROM_BASE, ROM_SIZE, &image(), RomFlags::SHADOWED, "vga bios")
        .unwrap();
}

fn read_rom(h: &common::Harness) -> Vec<u8> {
    let mut buf = vec![0u8; ROM_SIZE as usize];
    h.space.read(ROM_BASE, &mut buf).unwrap();
    buf
}

fn expected_image() -> Vec<u8> {
    let mut bytes = image();
    bytes.resize(ROM_SIZE as usize, 0);
    bytes
}

#[test]
fn shadow_writes_leave_the_virgin_copy_alone() {
    let h = common::harness();
    vga_bios(&h);
    assert_eq!(h.space.regions().len(), 1, "ROM lives inside the RAM region");
    assert_eq!(read_rom(&h), expected_image());

    // Write-protected ROM drops writes.
    h.space.write_u8(ROM_BASE + 1, 0xEE).unwrap();
    assert_eq!(h.space.read_u8(ROM_BASE + 1).unwrap(), 1);

    // Shadow RAM enabled for reads and writes.
    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRamWriteRam)
        .unwrap();
    let page = h.space.page_info(ROM_BASE).unwrap();
    assert_eq!(page.kind, PageKind::RomShadow);
    assert_eq!(page.handler, HandlerState::None);
    assert_eq!(h.space.read_u8(ROM_BASE + 1).unwrap(), 0, "fresh shadow reads as zero");
    h.space.write_u32(ROM_BASE + 0x1000, 0x5555_5555).unwrap();
    assert_eq!(h.space.read_u32(ROM_BASE + 0x1000).unwrap(), 0x5555_5555);
    assert_eq!(
        h.space.page_info(ROM_BASE + 0x1000).unwrap().state,
        PageState::Allocated
    );

    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRomWriteIgnore)
        .unwrap();
    assert_eq!(h.space.page_info(ROM_BASE).unwrap().kind, PageKind::Rom);
    assert_eq!(read_rom(&h), expected_image());
}

#[test]
fn read_rom_write_ram_fills_the_shadow_behind_the_rom() {
    let h = common::harness();
    vga_bios(&h);
    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRomWriteRam)
        .unwrap();

    h.space.write_u8(ROM_BASE + 0x2000, 0x42).unwrap();
    assert_eq!(
        h.space.read_u8(ROM_BASE + 0x2000).unwrap(),
        expected_image()[0x2000],
        "reads still come from the ROM"
    );

    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRamWriteIgnore)
        .unwrap();
    assert_eq!(h.space.read_u8(ROM_BASE + 0x2000).unwrap(), 0x42);
    h.space.write_u8(ROM_BASE + 0x2000, 0x43).unwrap();
    assert_eq!(h.space.read_u8(ROM_BASE + 0x2000).unwrap(), 0x42);
}

#[test]
fn repeating_the_current_protection_is_a_no_op() {
    let h = common::harness();
    vga_bios(&h);
    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRamWriteRam)
        .unwrap();

    let generation = h.space.generation();
    let invalidations = h.pool.invalidations();
    let pages = h.space.page_info(ROM_BASE).unwrap();
    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRamWriteRam)
        .unwrap();
    assert_eq!(h.space.generation(), generation);
    assert_eq!(h.pool.invalidations(), invalidations);
    assert_eq!(h.space.page_info(ROM_BASE).unwrap(), pages);
}

#[test]
fn protection_changes_invalidate_each_swapped_page() {
    let h = common::harness();
    vga_bios(&h);
    let before = h.pool.invalidations();
    h.space
        .protect_rom(ROM_BASE, 2 * PAGE_SIZE, RomProt::ReadRamWriteIgnore)
        .unwrap();
    assert_eq!(h.pool.invalidations(), before + 2);
    assert_eq!(
        h.space.rom_protection(ROM_BASE + 2 * PAGE_SIZE),
        Some(RomProt::ReadRomWriteIgnore)
    );

    // Only the write side changes; the live copy stays the same.
    h.space
        .protect_rom(ROM_BASE, 2 * PAGE_SIZE, RomProt::ReadRamWriteRam)
        .unwrap();
    assert_eq!(h.pool.invalidations(), before + 2);
}

#[test]
fn reset_drops_the_shadow_and_restores_the_image() {
    let h = common::harness();
    vga_bios(&h);
    h.space
        .protect_rom(ROM_BASE, ROM_SIZE, RomProt::ReadRamWriteRam)
        .unwrap();
    h.space.write_u8(ROM_BASE, 0x77).unwrap();
    let outstanding = h.alloc.outstanding_pages();

    h.space.reset_roms().unwrap();
    assert_eq!(h.space.rom_protection(ROM_BASE), Some(RomProt::ReadRomWriteIgnore));
    assert_eq!(h.alloc.outstanding_pages(), outstanding - 1);
    assert_eq!(read_rom(&h), expected_image());

    h.space.request_rom_restore_on_reset();
    h.space.reset_roms().unwrap();
    assert_eq!(read_rom(&h), expected_image());
}

#[test]
fn rom_registration_rejects_bad_destinations() {
    let h = common::harness();
    h.space.register_ram(0, 0x10_0000, "ram").unwrap();
    h.space
        .register_rom(0xf_0000, 0x1_0000, &[0xF4], RomFlags::empty(), "bios")
        .unwrap();

    assert!(matches!(
        h.space
            .register_rom(0xf_8000, PAGE_SIZE, &[0], RomFlags::empty(), "overlap"),
        Err(PhysError::HandlerConflict { .. })
    ));
    assert!(matches!(
        h.space
            .register_rom(0xf_f000, 2 * PAGE_SIZE, &[0], RomFlags::empty(), "straddle"),
        Err(PhysError::HandlerConflict { .. } | PhysError::Conflict { .. })
    ));
    // Non-shadowed ROM ignores protection changes.
    h.space
        .protect_rom(0xf_0000, 0x1_0000, RomProt::ReadRamWriteRam)
        .unwrap();
    assert_eq!(h.space.rom_protection(0xf_0000), Some(RomProt::ReadRomWriteIgnore));
    assert_eq!(h.space.read_u8(0xf_0000).unwrap(), 0xF4);
}

#[test]
fn registration_without_host_memory_changes_nothing() {
    let h = common::harness_on(
        HeapAllocator::with_page_limit(common::CHUNK_SHIFT, 2),
        PhysSpaceOptions {
            execution_manager_mandatory: true,
            ..PhysSpaceOptions::default()
        },
    );
    h.space.register_ram(0, 0x10_0000, "conventional").unwrap();
    let regions = h.space.regions();

    let err = h
        .space
        .register_rom(ROM_BASE, ROM_SIZE, &image(), RomFlags::SHADOWED, "vga bios")
        .unwrap_err();
    assert!(matches!(err, PhysError::ResourceExhausted(_)));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert_eq!(h.space.regions(), regions);
    assert_eq!(h.space.stats().rom_overlays, 0);
    assert_eq!(h.alloc.outstanding_pages(), 0);
    assert_eq!(h.space.page_info(ROM_BASE).unwrap().kind, PageKind::Ram);
    assert_eq!(h.space.read_u8(ROM_BASE).unwrap(), 0);

    h.space
        .register_rom(0xf_0000, 2 * PAGE_SIZE, &[0xEA], RomFlags::empty(), "bios")
        .unwrap();
    assert_eq!(h.space.read_u8(0xf_0000).unwrap(), 0xEA);
    assert_eq!(h.space.stats().rom_overlays, 1);
}
