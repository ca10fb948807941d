#![cfg(not(target_arch = "wasm32"))]

mod common;

use aero_phys_space::{MmioHandler, RegionInfo, PAGE_SIZE};
use proptest::prelude::*;

const SPACE_PAGES: u64 = 64;

struct Nop;

impl MmioHandler for Nop {
    fn read(&mut self, _offset: u64, _size: usize) -> u64 {
        0
    }

    fn write(&mut self, _offset: u64, _size: usize, _value: u64) {}
}

#[derive(Clone, Debug)]
enum Op {
    Ram { page: u64, pages: u64 },
    Mmio { page: u64, pages: u64 },
    DropMmio(usize),
}

prop_compose! {
    fn arb_range()(page in 0u64..SPACE_PAGES)(
        page in Just(page),
        pages in 1u64..=(SPACE_PAGES - page).min(12),
    ) -> (u64, u64) {
        (page, pages)
    }
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => arb_range().prop_map(|(page, pages)| Op::Ram { page, pages }),
        3 => arb_range().prop_map(|(page, pages)| Op::Mmio { page, pages }),
        1 => any::<usize>().prop_map(Op::DropMmio),
    ]
}

fn covering(regions: &[RegionInfo], addr: u64) -> Option<&RegionInfo> {
    regions.iter().find(|r| r.base <= addr && addr <= r.last)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn directory_stays_ordered_and_disjoint(ops in prop::collection::vec(arb_op(), 1..24)) {
        let h = common::harness();
        // Live MMIO registrations: (addr, size, pages added to the directory).
        let mut mmio: Vec<(u64, u64, u64)> = Vec::new();

        for op in ops {
            let before = h.space.regions();
            let total = h.space.stats().total_pages;

            let (result, added) = match op {
                Op::Ram { page, pages } => {
                    let r = h.space.register_ram(page * PAGE_SIZE, pages * PAGE_SIZE, "ram");
                    (r, pages as i64)
                }
                Op::Mmio { page, pages } => {
                    let (addr, size) = (page * PAGE_SIZE, pages * PAGE_SIZE);
                    let r = h.space.register_mmio(addr, size, Box::new(Nop), "mmio");
                    let added = h.space.stats().total_pages - total;
                    if r.is_ok() {
                        prop_assert!(added == 0 || added == pages);
                        mmio.push((addr, size, added));
                    }
                    (r, added as i64)
                }
                Op::DropMmio(pick) => {
                    if mmio.is_empty() {
                        continue;
                    }
                    let (addr, size, added) = mmio.remove(pick % mmio.len());
                    (h.space.deregister_mmio(addr, size), -(added as i64))
                }
            };

            let after = h.space.regions();
            let now = h.space.stats().total_pages;
            match result {
                Ok(()) => prop_assert_eq!(now as i64, total as i64 + added),
                Err(_) => {
                    prop_assert_eq!(&after, &before);
                    prop_assert_eq!(now, total);
                }
            }

            for pair in after.windows(2) {
                prop_assert!(pair[0].last < pair[1].base);
            }
            let sum: u64 = after.iter().map(|r| r.page_count).sum();
            prop_assert_eq!(sum, now);

            for page in 0..SPACE_PAGES {
                let addr = page * PAGE_SIZE + 0x10;
                let found = h.space.lookup_region(addr);
                prop_assert_eq!(found.as_ref(), covering(&after, addr));
                prop_assert_eq!(h.space.page_info(addr).is_some(), found.is_some());
            }
        }
    }
}
