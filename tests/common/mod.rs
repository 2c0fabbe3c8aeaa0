//! Builds small synthetic ELF64 executables for the integration tests.

#![allow(dead_code)]

use elfpager::consts::{ELF64_EHDR_SIZE, ELF64_PHDR_SIZE, EM_X86_64, ET_EXEC, PF_R, PF_W, PF_X, PT_GNU_STACK, PT_LOAD};

pub const PAGE: u64 = 0x1000;

#[derive(Clone, Debug)]
pub struct SegmentSpec {
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: u32,
}

impl SegmentSpec {
    pub fn text(vaddr: u64, size: u64) -> Self {
        Self {
            vaddr,
            filesz: size,
            memsz: size,
            flags: PF_R | PF_X,
        }
    }

    pub fn data(vaddr: u64, filesz: u64, memsz: u64) -> Self {
        Self {
            vaddr,
            filesz,
            memsz,
            flags: PF_R | PF_W,
        }
    }
}

/// Byte stored at file offset `offset`; never zero so zero-fill is visible.
pub fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8 + 1
}

fn phdr(out: &mut Vec<u8>, p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&PAGE.to_le_bytes());
}

/// Lays out `segments` after the headers, each at a file offset congruent to
/// its address modulo the page size, with a `PT_GNU_STACK` header last.
pub fn build_elf(entry: u64, segments: &[SegmentSpec]) -> Vec<u8> {
    let phnum = segments.len() + 1;
    let mut out = Vec::new();

    out.extend_from_slice(b"\x7fELF");
    out.extend_from_slice(&[2, 1, 1, 0]);
    out.resize(16, 0);
    out.extend_from_slice(&ET_EXEC.to_le_bytes());
    out.extend_from_slice(&EM_X86_64.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(ELF64_EHDR_SIZE as u64).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(phnum as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 6]);
    assert_eq!(out.len(), ELF64_EHDR_SIZE);

    let mut offsets = Vec::with_capacity(segments.len());
    let mut cursor = (ELF64_EHDR_SIZE + phnum * ELF64_PHDR_SIZE) as u64;
    for seg in segments {
        let page_base = (cursor + PAGE - 1) / PAGE * PAGE;
        let offset = page_base + seg.vaddr % PAGE;
        offsets.push(offset);
        cursor = offset + seg.filesz;
    }

    for (seg, offset) in segments.iter().zip(&offsets) {
        phdr(&mut out, PT_LOAD, seg.flags, *offset, seg.vaddr, seg.filesz, seg.memsz);
    }
    phdr(&mut out, PT_GNU_STACK, PF_R | PF_W, 0, 0, 0, 0);

    for (seg, offset) in segments.iter().zip(&offsets) {
        out.resize(*offset as usize, 0);
        out.extend((*offset..*offset + seg.filesz).map(pattern));
    }
    out
}

/// The file offset `build_elf` chose for segment `index`.
pub fn segment_offset(image: &[u8], index: usize) -> u64 {
    let at = ELF64_EHDR_SIZE + index * ELF64_PHDR_SIZE + 8;
    u64::from_le_bytes(image[at..at + 8].try_into().unwrap())
}
