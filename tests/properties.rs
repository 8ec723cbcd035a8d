use std::collections::BTreeSet;

use proptest::prelude::*;

use paging_sim::region::{Coalesce, Region, Vma};
use paging_sim::{AccessMode, Error, MemPhy, PAGE_SIZE, Pid, VmManager};

#[derive(Debug, Clone)]
enum FrameOp {
    Acquire,
    MarkUsed(usize),
    Release(usize),
}

fn arb_frame_op() -> impl Strategy<Value = FrameOp> {
    prop_oneof![
        Just(FrameOp::Acquire),
        (0usize..16).prop_map(FrameOp::MarkUsed),
        (0usize..16).prop_map(FrameOp::Release),
    ]
}

#[derive(Debug, Clone)]
enum RegionOp {
    Alloc(usize),
    Free(usize),
}

fn arb_region_op() -> impl Strategy<Value = RegionOp> {
    prop_oneof![
        (1usize..300).prop_map(RegionOp::Alloc),
        any::<usize>().prop_map(RegionOp::Free),
    ]
}

fn arb_access_mode() -> impl Strategy<Value = AccessMode> {
    prop_oneof![Just(AccessMode::Random), Just(AccessMode::Sequential)]
}

proptest! {
    #[test]
    fn frame_is_in_exactly_one_place(ops in prop::collection::vec(arb_frame_op(), 0..64)) {
        let mut mp = MemPhy::new(8 * PAGE_SIZE, AccessMode::Random).unwrap();
        let n = mp.num_frames();
        // acquired but not yet marked used
        let mut held = BTreeSet::new();

        for op in ops {
            match op {
                FrameOp::Acquire => {
                    if let Some(fpn) = mp.acquire_free_frame() {
                        prop_assert!(held.insert(fpn));
                    } else {
                        prop_assert_eq!(mp.free_count(), 0);
                    }
                }
                FrameOp::MarkUsed(k) => {
                    let fpn = k % n;
                    let ok = mp.mark_used(fpn, Pid(1)).is_ok();
                    prop_assert_eq!(ok, held.remove(&fpn));
                }
                FrameOp::Release(k) => {
                    let fpn = k % n;
                    let was_free = mp.is_free(fpn);
                    let result = mp.release_frame(fpn);
                    if was_free {
                        prop_assert!(matches!(result, Err(Error::InvalidFrame(_))));
                    } else {
                        prop_assert!(result.is_ok());
                        held.remove(&fpn);
                    }
                }
            }

            for fpn in 0..n {
                let places = [mp.is_free(fpn), mp.owner_of(fpn).is_some(), held.contains(&fpn)];
                prop_assert_eq!(places.iter().filter(|&&p| p).count(), 1);
            }
            prop_assert_eq!(mp.free_count() + mp.used_count() + held.len(), n);
        }
    }

    #[test]
    fn free_list_stays_disjoint(ops in prop::collection::vec(arb_region_op(), 0..80)) {
        let mut vma = Vma::new(0, 0);
        let mut live: Vec<Region> = Vec::new();

        for op in ops {
            match op {
                RegionOp::Alloc(size) => {
                    let rg = match vma.get_free_region(size) {
                        Some(rg) => rg,
                        None => {
                            let inc = vma.extension_for(size);
                            vma.grow(inc);
                            vma.take_at_brk(size)
                        }
                    };
                    prop_assert!(live.iter().all(|other| !other.overlaps(&rg)));
                    live.push(rg);
                }
                RegionOp::Free(k) => {
                    if live.is_empty() {
                        continue;
                    }
                    let rg = live.swap_remove(k % live.len());
                    let before = vma.free_regions().len();
                    let outcome = vma.enlist_free_region(rg).unwrap();
                    let after = vma.free_regions().len();
                    match outcome {
                        Coalesce::Inserted => prop_assert_eq!(after, before + 1),
                        Coalesce::MergedBelow | Coalesce::MergedAbove => prop_assert_eq!(after, before),
                        Coalesce::Bridged => prop_assert_eq!(after, before - 1),
                    }
                }
            }

            let free = vma.free_regions();
            for (i, a) in free.iter().enumerate() {
                prop_assert!(!a.is_empty());
                for b in &free[i + 1..] {
                    prop_assert!(!a.overlaps(b));
                    prop_assert!(a.end != b.start && b.end != a.start, "unmerged neighbours {:?} {:?}", a, b);
                }
            }
            let covered: usize = free.iter().chain(live.iter()).map(Region::len).sum();
            prop_assert_eq!(covered, vma.sbrk - vma.vm_start);
            prop_assert!(vma.sbrk <= vma.vm_end);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn write_read_round_trip_under_faults(
        data in prop::collection::vec(any::<u8>(), 1..1200),
        filler in 1usize..1024,
        tlb in any::<bool>(),
        ram_mode in arb_access_mode(),
        swap_mode in arb_access_mode(),
    ) {
        let ram = MemPhy::new(4 * PAGE_SIZE, ram_mode).unwrap();
        let swap = MemPhy::new(16 * PAGE_SIZE, swap_mode).unwrap();
        let mut vm = VmManager::new(ram, vec![swap]).with_tlb(tlb);
        let p = Pid(1);
        vm.spawn(p, 0).unwrap();

        vm.allocate(p, data.len(), 0).unwrap();
        for (offset, &byte) in data.iter().enumerate() {
            vm.write(p, 0, offset, byte).unwrap();
        }
        // another region pushes pages of region 0 out of RAM
        vm.allocate(p, filler, 1).unwrap();
        vm.write(p, 1, filler - 1, 0x5A).unwrap();

        for (offset, &byte) in data.iter().enumerate() {
            prop_assert_eq!(vm.read(p, 0, offset).unwrap(), byte);
        }
        prop_assert_eq!(vm.read(p, 1, filler - 1).unwrap(), 0x5A);
    }
}
