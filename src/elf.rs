use std::io;
use std::path::Path;

use crate::arith::{align_up, checked_add};
use crate::consts::{
    EI_CLASS, EI_DATA, EI_MAG0, EI_MAG1, EI_MAG2, EI_MAG3, ELF64_EHDR_SIZE, ELF64_PHDR_SIZE,
    ELFCLASS64, ELFDATA2LSB, ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3, EM_X86_64, ET_DYN, ET_EXEC, PT_INTERP,
    PT_LOAD, PT_PHDR, SELFMAG,
};
use crate::error::{LoaderError, Result};
use crate::model::{ImageDescriptor, ProgramHeader, ProgramHeaderTable, SegmentDescriptor};
use crate::source::{FdSource, ImageSource};

/// The fields of `Elf64_Ehdr` the loader uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

/// A parsed image together with the source its segments are read from.
///
/// The eager mapper only borrows the source while mapping; the demand pager
/// takes ownership because faults read from it for the life of the process.
#[derive(Debug)]
pub struct LoadedImage<S> {
    pub descriptor: ImageDescriptor,
    pub source: S,
}

// Callers pass buffers already checked to hold `off + N` bytes.
fn read_u16_le(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32_le(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn read_u64_le(bytes: &[u8], off: usize) -> u64 {
    let mut le = [0u8; 8];
    le.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(le)
}

fn has_magic(bytes: &[u8]) -> bool {
    bytes[EI_MAG0] == ELFMAG0
        && bytes[EI_MAG1] == ELFMAG1
        && bytes[EI_MAG2] == ELFMAG2
        && bytes[EI_MAG3] == ELFMAG3
}

/// Parses the file header from however many leading bytes were available.
pub fn parse_header(bytes: &[u8]) -> Result<ElfHeader> {
    if bytes.len() >= SELFMAG && !has_magic(bytes) {
        let mut magic = [0u8; SELFMAG];
        magic.copy_from_slice(&bytes[..SELFMAG]);
        return Err(LoaderError::NotAnImage { magic });
    }
    if bytes.len() < ELF64_EHDR_SIZE {
        return Err(LoaderError::TruncatedHeader {
            available: bytes.len(),
            required: ELF64_EHDR_SIZE,
        });
    }

    if bytes[EI_CLASS] != ELFCLASS64 {
        return Err(LoaderError::unsupported(format!("ELF class {} is not ELF64", bytes[EI_CLASS])));
    }
    if bytes[EI_DATA] != ELFDATA2LSB {
        return Err(LoaderError::unsupported(format!(
            "ELF data encoding {} is not little-endian",
            bytes[EI_DATA]
        )));
    }

    let header = ElfHeader {
        e_type: read_u16_le(bytes, 16),
        e_machine: read_u16_le(bytes, 18),
        e_entry: read_u64_le(bytes, 24),
        e_phoff: read_u64_le(bytes, 32),
        e_phentsize: read_u16_le(bytes, 54),
        e_phnum: read_u16_le(bytes, 56),
    };

    if header.e_type == ET_DYN {
        return Err(LoaderError::unsupported(
            "ET_DYN image; position-independent executables are not loaded",
        ));
    }
    if header.e_type != ET_EXEC {
        return Err(LoaderError::unsupported(format!(
            "ELF type {} is not ET_EXEC; only fixed-address executables load",
            header.e_type
        )));
    }
    if header.e_machine != EM_X86_64 {
        return Err(LoaderError::unsupported(format!(
            "machine {} is not EM_X86_64",
            header.e_machine
        )));
    }
    if (header.e_phentsize as usize) < ELF64_PHDR_SIZE {
        return Err(LoaderError::unsupported(format!(
            "program header entry size {} is below {}",
            header.e_phentsize, ELF64_PHDR_SIZE
        )));
    }

    Ok(header)
}

/// Decodes one program-header record of at least 56 bytes.
pub fn parse_program_header(record: &[u8]) -> ProgramHeader {
    ProgramHeader {
        p_type: read_u32_le(record, 0),
        p_flags: read_u32_le(record, 4),
        p_offset: read_u64_le(record, 8),
        p_vaddr: read_u64_le(record, 16),
        p_filesz: read_u64_le(record, 32),
        p_memsz: read_u64_le(record, 40),
        p_align: read_u64_le(record, 48),
    }
}

/// Reads the table one record at a time so a bogus `e_phnum` cannot force a
/// large allocation before the file proves it has that many bytes.
pub fn read_program_headers<S: ImageSource + ?Sized>(source: &S, header: &ElfHeader) -> Result<Vec<ProgramHeader>> {
    let entry_size = header.e_phentsize as usize;
    let count = header.e_phnum as usize;
    let required = entry_size * count;

    let mut record = vec![0u8; entry_size];
    let mut headers = Vec::new();
    for index in 0..count {
        let offset = checked_add(header.e_phoff, (index * entry_size) as u64, "program header offset")?;
        let got = source
            .read_full_at(offset, &mut record)
            .map_err(io::Error::from_raw_os_error)?;
        if got < entry_size {
            return Err(LoaderError::TruncatedProgramHeaders {
                offset: header.e_phoff,
                available: index * entry_size + got,
                required,
            });
        }
        headers.push(parse_program_header(&record));
    }
    Ok(headers)
}

fn validate_segment(index: usize, seg: &SegmentDescriptor, page_size: u64) -> Result<()> {
    if seg.file_size > seg.memory_size {
        return Err(LoaderError::unsupported(format!(
            "segment {index}: file size {:#x} exceeds memory size {:#x}",
            seg.file_size, seg.memory_size
        )));
    }
    let end = checked_add(seg.virtual_start, seg.memory_size, "segment end")?;
    align_up(end, page_size, "segment page end")?;
    checked_add(seg.file_offset, seg.file_size, "segment file end")?;
    Ok(())
}

/// Rejects images in which two loadable segments touch the same page.
fn check_disjoint_pages(segments: &[SegmentDescriptor], page_size: u64) -> Result<()> {
    for (i, a) in segments.iter().enumerate() {
        for (j, b) in segments.iter().enumerate().skip(i + 1) {
            if a.memory_size == 0 || b.memory_size == 0 {
                continue;
            }
            let disjoint = a.page_end(page_size) <= b.page_start(page_size)
                || b.page_end(page_size) <= a.page_start(page_size);
            if !disjoint {
                return Err(LoaderError::unsupported(format!(
                    "segments {i} ({:#x}..{:#x}) and {j} ({:#x}..{:#x}) share a page",
                    a.virtual_start,
                    a.virtual_end(),
                    b.virtual_start,
                    b.virtual_end()
                )));
            }
        }
    }
    Ok(())
}

/// Locates the program-header table in the loaded image: `PT_PHDR` if the
/// image has one, otherwise the loadable segment whose file bytes cover it.
fn phdr_vaddr(header: &ElfHeader, headers: &[ProgramHeader]) -> Option<u64> {
    if let Some(ph) = headers.iter().find(|ph| ph.p_type == PT_PHDR) {
        return Some(ph.p_vaddr);
    }
    let table_len = header.e_phentsize as u64 * header.e_phnum as u64;
    let table_end = header.e_phoff.checked_add(table_len)?;
    headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .find(|ph| {
            header.e_phoff >= ph.p_offset
                && ph
                    .p_offset
                    .checked_add(ph.p_filesz)
                    .is_some_and(|end| table_end <= end)
        })
        .and_then(|ph| ph.p_vaddr.checked_add(header.e_phoff - ph.p_offset))
}

/// Builds the descriptor from an already-decoded header table, keeping only
/// loadable segments in their on-disk order.
pub fn describe(header: &ElfHeader, headers: &[ProgramHeader], page_size: u64) -> Result<ImageDescriptor> {
    if headers.iter().any(|ph| ph.p_type == PT_INTERP) {
        return Err(LoaderError::unsupported("image requests a program interpreter (dynamically linked)"));
    }
    let segments: Vec<SegmentDescriptor> = headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .map(SegmentDescriptor::from_header)
        .collect();

    for (index, seg) in segments.iter().enumerate() {
        validate_segment(index, seg, page_size)?;
    }
    check_disjoint_pages(&segments, page_size)?;

    let skipped = headers.len() - segments.len();
    if skipped > 0 {
        log::debug!("ignoring {skipped} non-loadable program headers");
    }

    Ok(ImageDescriptor {
        entry: header.e_entry,
        segments,
        program_headers: ProgramHeaderTable {
            offset: header.e_phoff,
            count: header.e_phnum,
            entry_size: header.e_phentsize,
            vaddr: phdr_vaddr(header, headers),
        },
    })
}

pub fn read_image<S: ImageSource>(source: S, page_size: u64) -> Result<LoadedImage<S>> {
    let mut ehdr = [0u8; ELF64_EHDR_SIZE];
    let available = source.read_full_at(0, &mut ehdr).map_err(io::Error::from_raw_os_error)?;
    let header = parse_header(&ehdr[..available])?;
    let headers = read_program_headers(&source, &header)?;
    let descriptor = describe(&header, &headers, page_size)?;

    log::info!(
        "image entry={:#x} loadable={} of {} program headers",
        descriptor.entry,
        descriptor.segments.len(),
        header.e_phnum
    );

    Ok(LoadedImage { descriptor, source })
}

pub fn open_image(path: &Path, page_size: u64) -> Result<LoadedImage<FdSource>> {
    let source = FdSource::open(path)?;
    read_image(source, page_size)
}
