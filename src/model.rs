use bitflags::bitflags;

use crate::arith::align_down;
use crate::consts::{PF_R, PF_W, PF_X, PT_LOAD};
use crate::rt;

bitflags! {
    /// Segment permission bits, numerically identical to `p_flags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = PF_X;
        const WRITE = PF_W;
        const READ = PF_R;
    }
}

impl SegmentFlags {
    pub const RW: SegmentFlags = SegmentFlags::READ.union(SegmentFlags::WRITE);
    pub const RWX: SegmentFlags = SegmentFlags::all();

    pub fn prot(self) -> i32 {
        let mut prot = rt::PROT_NONE;
        if self.contains(SegmentFlags::READ) {
            prot |= rt::PROT_READ;
        }
        if self.contains(SegmentFlags::WRITE) {
            prot |= rt::PROT_WRITE;
        }
        if self.contains(SegmentFlags::EXECUTE) {
            prot |= rt::PROT_EXEC;
        }
        prot
    }

    pub fn render(self) -> String {
        let mut out = String::with_capacity(3);
        out.push(if self.contains(SegmentFlags::READ) { 'R' } else { '-' });
        out.push(if self.contains(SegmentFlags::WRITE) { 'W' } else { '-' });
        out.push(if self.contains(SegmentFlags::EXECUTE) { 'X' } else { '-' });
        out
    }
}

/// One raw `Elf64_Phdr` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Other(u32),
}

impl From<u32> for SegmentKind {
    fn from(p_type: u32) -> Self {
        if p_type == PT_LOAD {
            SegmentKind::Load
        } else {
            SegmentKind::Other(p_type)
        }
    }
}

/// The part of one page that is backed by file bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileWindow {
    /// Offset of the first file byte inside the page.
    pub page_offset: usize,
    pub file_offset: u64,
    pub len: usize,
}

/// A loadable segment. The reader guarantees `file_size <= memory_size` and
/// that `virtual_start + memory_size` rounded up to a page does not overflow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub virtual_start: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub memory_size: u64,
    pub kind: SegmentKind,
    pub permissions: SegmentFlags,
}

impl SegmentDescriptor {
    pub fn from_header(ph: &ProgramHeader) -> Self {
        Self {
            virtual_start: ph.p_vaddr,
            file_offset: ph.p_offset,
            file_size: ph.p_filesz,
            memory_size: ph.p_memsz,
            kind: SegmentKind::from(ph.p_type),
            permissions: SegmentFlags::from_bits_truncate(ph.p_flags),
        }
    }

    pub fn virtual_end(&self) -> u64 {
        self.virtual_start + self.memory_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.virtual_start && addr < self.virtual_end()
    }

    pub fn page_start(&self, page_size: u64) -> u64 {
        align_down(self.virtual_start, page_size)
    }

    /// First page boundary at or above the end of the segment.
    pub fn page_end(&self, page_size: u64) -> u64 {
        align_down(self.virtual_end() + (page_size - 1), page_size)
    }

    pub fn page_count(&self, page_size: u64) -> u64 {
        if self.memory_size == 0 {
            return 0;
        }
        (self.page_end(page_size) - self.page_start(page_size)) / page_size
    }

    pub fn in_page_offset(&self, page_size: u64) -> u64 {
        self.virtual_start - self.page_start(page_size)
    }

    /// Bytes an eager mapping of this segment covers, starting at `page_start`.
    pub fn map_size(&self, page_size: u64) -> u64 {
        self.in_page_offset(page_size) + self.memory_size
    }

    pub fn zero_fill_size(&self) -> u64 {
        self.memory_size - self.file_size
    }

    /// Which bytes of the page at `page` come from the file, if any.
    ///
    /// Bytes of the page below `virtual_start` or at and above
    /// `virtual_start + file_size` are not file-backed and stay zero.
    pub fn file_window(&self, page: u64, page_size: u64) -> Option<FileWindow> {
        let file_end = self.virtual_start + self.file_size;
        let lo = page.max(self.virtual_start);
        let hi = page.saturating_add(page_size).min(file_end);
        if lo >= hi {
            return None;
        }
        Some(FileWindow {
            page_offset: (lo - page) as usize,
            file_offset: self.file_offset + (lo - self.virtual_start),
            len: (hi - lo) as usize,
        })
    }
}

/// Where the program-header table lives in the file and, if it is covered by
/// a segment, in the loaded image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramHeaderTable {
    pub offset: u64,
    pub count: u16,
    pub entry_size: u16,
    pub vaddr: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub entry: u64,
    /// Loadable segments in program-header order.
    pub segments: Vec<SegmentDescriptor>,
    pub program_headers: ProgramHeaderTable,
}

impl ImageDescriptor {
    /// First segment, in program-header order, whose memory range holds `addr`.
    pub fn segment_containing(&self, addr: u64) -> Option<(usize, &SegmentDescriptor)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, seg)| seg.contains(addr))
    }

    pub fn total_pages(&self, page_size: u64) -> u64 {
        self.segments.iter().map(|s| s.page_count(page_size)).sum()
    }
}
