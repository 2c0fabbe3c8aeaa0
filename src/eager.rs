//! Eager segment mapper: every loadable segment is mapped and populated
//! before the program starts.

use crate::arith::to_usize;
use crate::config::ProtectionPolicy;
use crate::error::Result;
use crate::memory::AddressSpace;
use crate::model::{ImageDescriptor, SegmentFlags};
use crate::source::{read_segment_bytes, ImageSource};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EagerReport {
    pub segments_mapped: usize,
    pub bytes_mapped: u64,
    pub bytes_read: u64,
}

pub fn map_image<S, M>(
    image: &ImageDescriptor,
    source: &S,
    memory: &mut M,
    page_size: u64,
    policy: ProtectionPolicy,
) -> Result<EagerReport>
where
    S: ImageSource + ?Sized,
    M: AddressSpace + ?Sized,
{
    let initial = if policy.is_strict() {
        SegmentFlags::RW
    } else {
        SegmentFlags::RWX
    };
    let mut report = EagerReport::default();

    for (index, seg) in image.segments.iter().enumerate() {
        if seg.memory_size == 0 {
            log::debug!("segment {index}: empty, skipped");
            continue;
        }

        let page_start = seg.page_start(page_size);
        let map_size = seg.map_size(page_size);
        let in_page = to_usize(seg.in_page_offset(page_size), "segment in-page offset")?;
        let file_size = to_usize(seg.file_size, "segment file size")?;

        let bytes = memory.map_zeroed(page_start, map_size, initial)?;
        read_segment_bytes(source, seg.file_offset, &mut bytes[in_page..in_page + file_size])?;

        if policy.is_strict() {
            memory.protect(page_start, map_size, seg.permissions)?;
        }

        log::info!(
            "segment {index}: mapped {:#x}..{:#x} {} ({:#x} file bytes, {:#x} zero-fill)",
            page_start,
            page_start + map_size,
            seg.permissions.render(),
            seg.file_size,
            seg.zero_fill_size()
        );
        report.segments_mapped += 1;
        report.bytes_mapped += map_size;
        report.bytes_read += seg.file_size;
    }

    Ok(report)
}
