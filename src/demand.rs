//! Fault-driven segment mapper.
//!
//! Nothing is mapped up front. Each access-violation fault inside a loadable
//! segment maps exactly one zeroed page and copies in the part of it that is
//! backed by the file. [`DemandPager::resolve`] is the whole handler; the
//! signal plumbing lives in `fault`.

use crate::arith::align_down;
use crate::config::ProtectionPolicy;
use crate::elf::LoadedImage;
use crate::error::{LoaderError, Result};
use crate::memory::AddressSpace;
use crate::model::{ImageDescriptor, SegmentFlags};
use crate::source::{read_segment_bytes, ImageSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Nothing is mapped at the address (`SEGV_MAPERR`).
    Unmapped,
    /// A mapping exists but does not allow the access (`SEGV_ACCERR`).
    Permission,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    pub address: u64,
    pub kind: FaultKind,
}

impl Fault {
    pub fn unmapped(address: u64) -> Self {
        Self {
            address,
            kind: FaultKind::Unmapped,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPage {
    pub page: u64,
    pub segment: usize,
    /// File bytes copied into the page; the rest of it reads as zero.
    pub file_bytes: usize,
}

#[derive(Clone, Copy, Debug)]
struct PageSpan {
    first_page: u64,
    pages: u64,
    bit_base: usize,
}

/// Pages resolved so far, one bit per page of every loadable segment.
///
/// All storage is allocated up front, so recording a page from inside the
/// fault handler never allocates. Pages are only ever added.
#[derive(Debug)]
pub struct AddressSpaceState {
    page_size: u64,
    spans: Vec<PageSpan>,
    bits: Vec<u64>,
    resolved: usize,
}

impl AddressSpaceState {
    pub fn for_image(image: &ImageDescriptor, page_size: u64) -> Self {
        let mut spans = Vec::with_capacity(image.segments.len());
        let mut bit_base = 0usize;
        for seg in &image.segments {
            let pages = seg.page_count(page_size);
            spans.push(PageSpan {
                first_page: seg.page_start(page_size),
                pages,
                bit_base,
            });
            bit_base += pages as usize;
        }
        Self {
            page_size,
            spans,
            bits: vec![0u64; bit_base.div_ceil(64)],
            resolved: 0,
        }
    }

    fn bit_for(&self, page: u64) -> Option<usize> {
        self.spans.iter().find_map(|span| {
            let index = page.checked_sub(span.first_page)? / self.page_size;
            (index < span.pages).then(|| span.bit_base + index as usize)
        })
    }

    pub fn contains(&self, page: u64) -> bool {
        self.bit_for(page)
            .is_some_and(|bit| self.bits[bit / 64] & (1 << (bit % 64)) != 0)
    }

    /// Records `page`; returns false if it was already present or lies
    /// outside every segment.
    pub fn insert(&mut self, page: u64) -> bool {
        let Some(bit) = self.bit_for(page) else {
            return false;
        };
        let mask = 1u64 << (bit % 64);
        if self.bits[bit / 64] & mask != 0 {
            return false;
        }
        self.bits[bit / 64] |= mask;
        self.resolved += 1;
        true
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved
    }

    pub fn resolved_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.spans.iter().flat_map(move |span| {
            (0..span.pages)
                .filter(move |i| {
                    let bit = span.bit_base + *i as usize;
                    self.bits[bit / 64] & (1 << (bit % 64)) != 0
                })
                .map(move |i| span.first_page + i * self.page_size)
        })
    }
}

/// The long-lived context the fault handler works against.
#[derive(Debug)]
pub struct DemandPager<S, M> {
    image: LoadedImage<S>,
    memory: M,
    state: AddressSpaceState,
    page_size: u64,
    policy: ProtectionPolicy,
}

impl<S: ImageSource, M: AddressSpace> DemandPager<S, M> {
    pub fn new(image: LoadedImage<S>, memory: M, page_size: u64, policy: ProtectionPolicy) -> Self {
        let state = AddressSpaceState::for_image(&image.descriptor, page_size);
        Self {
            image,
            memory,
            state,
            page_size,
            policy,
        }
    }

    pub fn image(&self) -> &ImageDescriptor {
        &self.image.descriptor
    }

    pub fn state(&self) -> &AddressSpaceState {
        &self.state
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Resolves one fault by mapping and filling the page that holds it.
    pub fn resolve(&mut self, fault: Fault) -> Result<ResolvedPage> {
        let address = fault.address;
        let Some((segment, seg)) = self.image.descriptor.segment_containing(address) else {
            return Err(LoaderError::SegmentationFault { address });
        };

        let page = align_down(address, self.page_size);
        if self.state.contains(page) {
            // With real permissions in place, an access the segment does not
            // allow faults on a page we already filled.
            if self.policy.is_strict() && fault.kind == FaultKind::Permission {
                return Err(LoaderError::SegmentationFault { address });
            }
            return Err(LoaderError::RepeatFault { page });
        }

        let initial = if self.policy.is_strict() {
            SegmentFlags::RW
        } else {
            SegmentFlags::RWX
        };
        let window = seg.file_window(page, self.page_size);
        let bytes = self.memory.map_zeroed(page, self.page_size, initial)?;
        let file_bytes = match window {
            Some(w) => {
                let dst = &mut bytes[w.page_offset..w.page_offset + w.len];
                read_segment_bytes(&self.image.source, w.file_offset, dst)?;
                w.len
            }
            None => 0,
        };
        if self.policy.is_strict() {
            self.memory.protect(page, self.page_size, seg.permissions)?;
        }
        self.state.insert(page);

        log::trace!("fault {address:#x}: segment {segment} page {page:#x} ({file_bytes:#x} file bytes)");
        Ok(ResolvedPage {
            page,
            segment,
            file_bytes,
        })
    }

    /// Resolves every page not yet resolved, as if the program had touched
    /// each byte of each segment. Returns the number of pages mapped.
    pub fn resolve_all(&mut self) -> Result<usize> {
        let mut targets = Vec::new();
        for seg in &self.image.descriptor.segments {
            let mut page = seg.page_start(self.page_size);
            for _ in 0..seg.page_count(self.page_size) {
                if !self.state.contains(page) {
                    targets.push(page.max(seg.virtual_start));
                }
                page += self.page_size;
            }
        }
        for address in &targets {
            self.resolve(Fault::unmapped(*address))?;
        }
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;
    use crate::model::{ProgramHeaderTable, SegmentDescriptor, SegmentKind};

    const PAGE: u64 = 0x1000;

    fn file() -> Vec<u8> {
        (0..0x4000usize).map(|i| (i % 253) as u8 + 1).collect()
    }

    fn pager(policy: ProtectionPolicy) -> DemandPager<Vec<u8>, SparseMemory> {
        let descriptor = ImageDescriptor {
            entry: 0x40_0100,
            segments: vec![
                SegmentDescriptor {
                    virtual_start: 0x40_0000,
                    file_offset: 0,
                    file_size: 0x1800,
                    memory_size: 0x1800,
                    kind: SegmentKind::Load,
                    permissions: SegmentFlags::READ | SegmentFlags::EXECUTE,
                },
                // File bytes end mid-page at 0x4037b0; zero-fill to 0x4057b0.
                SegmentDescriptor {
                    virtual_start: 0x40_27b0,
                    file_offset: 0x27b0,
                    file_size: 0x1000,
                    memory_size: 0x3000,
                    kind: SegmentKind::Load,
                    permissions: SegmentFlags::RW,
                },
            ],
            program_headers: ProgramHeaderTable {
                offset: 64,
                count: 2,
                entry_size: 56,
                vaddr: Some(0x40_0040),
            },
        };
        let image = LoadedImage {
            descriptor,
            source: file(),
        };
        DemandPager::new(image, SparseMemory::new(PAGE), PAGE, policy)
    }

    #[test]
    fn nothing_is_mapped_before_the_first_fault() {
        let pager = pager(ProtectionPolicy::Permissive);
        assert_eq!(pager.memory().mapped_pages(), 0);
        assert_eq!(pager.state().resolved_count(), 0);
    }

    #[test]
    fn fault_maps_exactly_one_page() {
        let mut pager = pager(ProtectionPolicy::Permissive);
        let resolved = pager.resolve(Fault::unmapped(0x40_1234)).unwrap();
        assert_eq!(
            resolved,
            ResolvedPage {
                page: 0x40_1000,
                segment: 0,
                file_bytes: 0x800
            }
        );
        assert_eq!(pager.memory().mapped_pages(), 1);
        assert!(pager.state().contains(0x40_1000));
        let data = file();
        assert_eq!(pager.memory().read(0x40_1000, 0x800).unwrap(), data[0x1000..0x1800].to_vec());
        assert!(pager.memory().read(0x40_1800, 0x800).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn second_fault_on_a_resolved_page_is_a_repeat() {
        let mut pager = pager(ProtectionPolicy::Permissive);
        pager.resolve(Fault::unmapped(0x40_0010)).unwrap();
        let err = pager.resolve(Fault::unmapped(0x40_0ff0)).unwrap_err();
        assert!(matches!(err, LoaderError::RepeatFault { page: 0x40_0000 }));
        assert_eq!(pager.state().resolved_count(), 1);
    }

    #[test]
    fn first_page_keeps_bytes_below_the_segment_zero() {
        let mut pager = pager(ProtectionPolicy::Permissive);
        let resolved = pager.resolve(Fault::unmapped(0x40_2900)).unwrap();
        assert_eq!(resolved.page, 0x40_2000);
        assert_eq!(resolved.file_bytes, 0x850);
        let mem = pager.memory();
        assert!(mem.read(0x40_2000, 0x7b0).unwrap().iter().all(|b| *b == 0));
        assert_eq!(mem.read(0x40_27b0, 0x850).unwrap(), file()[0x27b0..0x3000].to_vec());
    }

    #[test]
    fn zero_fill_tail_reads_as_zero() {
        let mut pager = pager(ProtectionPolicy::Permissive);
        // The page holding the end of the file bytes.
        let resolved = pager.resolve(Fault::unmapped(0x40_3900)).unwrap();
        assert_eq!(resolved.file_bytes, 0x7b0);
        assert!(pager.memory().read(0x40_37b0, 0x850).unwrap().iter().all(|b| *b == 0));
        // A page wholly inside the tail.
        let resolved = pager.resolve(Fault::unmapped(0x40_4800)).unwrap();
        assert_eq!(resolved.file_bytes, 0);
        assert!(pager.memory().read(0x40_4000, 0x1000).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn fault_outside_every_segment_is_a_segmentation_fault() {
        let mut pager = pager(ProtectionPolicy::Permissive);
        for address in [0, 0x3f_ffff, 0x40_1800, 0x40_27af, 0x40_57b0] {
            let err = pager.resolve(Fault::unmapped(address)).unwrap_err();
            assert!(matches!(err, LoaderError::SegmentationFault { address: a } if a == address));
        }
        assert_eq!(pager.memory().mapped_pages(), 0);
    }

    #[test]
    fn strict_policy_protects_pages_and_rejects_permission_faults() {
        let mut pager = pager(ProtectionPolicy::Strict);
        pager.resolve(Fault::unmapped(0x40_0000)).unwrap();
        assert_eq!(
            pager.memory().protection(0x40_0000),
            Some(SegmentFlags::READ | SegmentFlags::EXECUTE)
        );
        let err = pager
            .resolve(Fault {
                address: 0x40_0008,
                kind: FaultKind::Permission,
            })
            .unwrap_err();
        assert!(matches!(err, LoaderError::SegmentationFault { address: 0x40_0008 }));
    }

    #[test]
    fn resolve_all_touches_every_page_once() {
        let mut pager = pager(ProtectionPolicy::Permissive);
        pager.resolve(Fault::unmapped(0x40_3000)).unwrap();
        assert_eq!(pager.resolve_all().unwrap(), 5);
        assert_eq!(pager.state().resolved_count(), 6);
        let pages: Vec<u64> = pager.state().resolved_pages().collect();
        assert_eq!(
            pages,
            vec![0x40_0000, 0x40_1000, 0x40_2000, 0x40_3000, 0x40_4000, 0x40_5000]
        );
    }

    #[test]
    fn state_ignores_pages_outside_segments() {
        let pager = pager(ProtectionPolicy::Permissive);
        let mut state = AddressSpaceState::for_image(pager.image(), PAGE);
        assert!(!state.insert(0x50_0000));
        assert!(state.insert(0x40_5000));
        assert!(!state.insert(0x40_5000));
        assert_eq!(state.resolved_count(), 1);
    }
}
