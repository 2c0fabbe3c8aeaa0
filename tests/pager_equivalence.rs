mod common;

use common::{build_elf, pattern, segment_offset, SegmentSpec, PAGE};
use elfpager::demand::{DemandPager, Fault};
use elfpager::eager::map_image;
use elfpager::elf::read_image;
use elfpager::memory::SparseMemory;
use elfpager::{LoaderError, ProtectionPolicy};
use proptest::prelude::*;

/// (in-page offset, file size, extra zero-fill) per segment.
fn layouts() -> impl Strategy<Value = Vec<(u64, u64, u64)>> {
    prop::collection::vec((0..PAGE, 0..3 * PAGE, 0..2 * PAGE), 1..4)
}

/// Places segments one after another with an unmapped page between them.
fn place(layout: &[(u64, u64, u64)]) -> Vec<SegmentSpec> {
    let mut next_page = 0x40_0000;
    let mut out = Vec::new();
    for (i, (in_page, filesz, extra)) in layout.iter().enumerate() {
        let memsz = (filesz + extra).max(1);
        let vaddr = next_page + in_page;
        let flags = if i == 0 { 0x5 } else { 0x6 };
        out.push(SegmentSpec {
            vaddr,
            filesz: *filesz,
            memsz,
            flags,
        });
        let end = vaddr + memsz;
        next_page = (end + PAGE - 1) / PAGE * PAGE + PAGE;
    }
    out
}

fn snapshot(memory: &SparseMemory, segments: &[SegmentSpec]) -> Vec<Vec<u8>> {
    segments
        .iter()
        .map(|seg| {
            let start = seg.vaddr / PAGE * PAGE;
            let end = (seg.vaddr + seg.memsz + PAGE - 1) / PAGE * PAGE;
            memory.read(start, (end - start) as usize).unwrap()
        })
        .collect()
}

proptest! {
    #[test]
    fn eager_and_demand_memory_is_identical(layout in layouts(), policy in prop_oneof![
        Just(ProtectionPolicy::Permissive),
        Just(ProtectionPolicy::Strict),
    ]) {
        let segments = place(&layout);
        let image = build_elf(segments[0].vaddr, &segments);

        let loaded = read_image(image.clone(), PAGE).unwrap();
        let mut eager = SparseMemory::new(PAGE);
        map_image(&loaded.descriptor, &loaded.source, &mut eager, PAGE, policy).unwrap();

        let loaded = read_image(image.clone(), PAGE).unwrap();
        let mut pager = DemandPager::new(loaded, SparseMemory::new(PAGE), PAGE, policy);
        pager.resolve_all().unwrap();

        prop_assert_eq!(eager.mapped_pages(), pager.memory().mapped_pages());
        prop_assert_eq!(snapshot(&eager, &segments), snapshot(pager.memory(), &segments));

        for (index, seg) in segments.iter().enumerate() {
            let offset = segment_offset(&image, index);
            let bytes = pager.memory().read(seg.vaddr, seg.memsz as usize).unwrap();
            for (i, byte) in bytes.iter().enumerate() {
                let expected = if (i as u64) < seg.filesz { pattern(offset + i as u64) } else { 0 };
                prop_assert_eq!(*byte, expected);
            }
            let page = seg.vaddr / PAGE * PAGE;
            prop_assert_eq!(eager.protection(page), pager.memory().protection(page));
        }
    }

    #[test]
    fn every_fault_inside_a_segment_resolves_once(layout in layouts(), picks in prop::collection::vec(any::<u64>(), 1..16)) {
        let segments = place(&layout);
        let image = build_elf(segments[0].vaddr, &segments);
        let loaded = read_image(image, PAGE).unwrap();
        let mut pager = DemandPager::new(loaded, SparseMemory::new(PAGE), PAGE, ProtectionPolicy::Permissive);

        for pick in picks {
            let seg = &segments[(pick % segments.len() as u64) as usize];
            let address = seg.vaddr + (pick >> 8) % seg.memsz;
            let page = address / PAGE * PAGE;
            let already = pager.state().contains(page);
            match pager.resolve(Fault::unmapped(address)) {
                Ok(resolved) => {
                    prop_assert!(!already);
                    prop_assert_eq!(resolved.page, page);
                }
                Err(LoaderError::RepeatFault { page: p }) => {
                    prop_assert!(already);
                    prop_assert_eq!(p, page);
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
            prop_assert!(pager.state().contains(page));
        }
        prop_assert_eq!(pager.state().resolved_count() as u64, pager.memory().mapped_pages());
    }

    #[test]
    fn faults_between_segments_are_segmentation_faults(layout in layouts()) {
        let segments = place(&layout);
        let image = build_elf(segments[0].vaddr, &segments);
        let loaded = read_image(image, PAGE).unwrap();
        let mut pager = DemandPager::new(loaded, SparseMemory::new(PAGE), PAGE, ProtectionPolicy::Permissive);

        for seg in &segments {
            for address in [seg.vaddr.wrapping_sub(1), seg.vaddr + seg.memsz] {
                let err = pager.resolve(Fault::unmapped(address)).unwrap_err();
                prop_assert!(
                    matches!(err, LoaderError::SegmentationFault { address: a } if a == address),
                    "address {:#x}: {}", address, err
                );
            }
        }
        prop_assert_eq!(pager.memory().mapped_pages(), 0);
    }
}
