use std::io::{self, Write};

use crate::model::ImageDescriptor;
use crate::stack::{InitialStack, StackSummary, StackView};

pub fn print_image(out: &mut impl Write, image: &ImageDescriptor, page_size: u64) -> io::Result<()> {
    writeln!(out, "entry=0x{:016x}", image.entry)?;
    let phdrs = &image.program_headers;
    match phdrs.vaddr {
        Some(vaddr) => writeln!(
            out,
            "phdrs offset=0x{:x} count={} entsize={} vaddr=0x{:016x}",
            phdrs.offset, phdrs.count, phdrs.entry_size, vaddr
        )?,
        None => writeln!(
            out,
            "phdrs offset=0x{:x} count={} entsize={} (not loaded)",
            phdrs.offset, phdrs.count, phdrs.entry_size
        )?,
    }
    writeln!(out, "segments={}", image.segments.len())?;
    for (i, seg) in image.segments.iter().enumerate() {
        writeln!(
            out,
            "  segment[{}] vaddr=0x{:016x} memsz=0x{:x} offset=0x{:x} filesz=0x{:x} pages=0x{:016x}..0x{:016x} prot={}",
            i,
            seg.virtual_start,
            seg.memory_size,
            seg.file_offset,
            seg.file_size,
            seg.page_start(page_size),
            seg.page_end(page_size),
            seg.permissions.render(),
        )?;
    }
    Ok(())
}

/// Dumps the built stack image, one word or auxiliary pair per line.
pub fn print_stack_image(
    out: &mut impl Write,
    view: &StackView<'_>,
    stack: &InitialStack,
    summary: &StackSummary,
) -> io::Result<()> {
    writeln!(
        out,
        "stack base=0x{:016x} size=0x{:x} sp=0x{:016x} argc={} envc={} auxc={}",
        stack.base, stack.size, stack.stack_pointer, summary.argc, summary.envc, summary.auxc
    )?;

    let sp = stack.stack_pointer;
    let word = |addr: u64| view.read_u64(addr).unwrap_or(0);
    let string = |ptr: u64| {
        view.read_cstr(ptr)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default()
    };

    writeln!(out, "  0x{:016x} argc {}", sp, word(sp))?;
    let mut pos = sp + 8;
    for i in 0..summary.argc {
        let ptr = word(pos);
        writeln!(out, "  0x{:016x} argv[{}] -> 0x{:016x} {:?}", pos, i, ptr, string(ptr))?;
        pos += 8;
    }
    writeln!(out, "  0x{:016x} argv[{}] NULL", pos, summary.argc)?;
    pos += 8;
    for i in 0..summary.envc {
        let ptr = word(pos);
        writeln!(out, "  0x{:016x} envp[{}] -> 0x{:016x} {:?}", pos, i, ptr, string(ptr))?;
        pos += 8;
    }
    writeln!(out, "  0x{:016x} envp[{}] NULL", pos, summary.envc)?;
    pos += 8;
    for i in 0..=summary.auxc {
        writeln!(
            out,
            "  0x{:016x} auxv[{}] type={} value=0x{:x}",
            pos,
            i,
            word(pos),
            word(pos + 8)
        )?;
        pos += 16;
    }
    writeln!(
        out,
        "  0x{:016x}..0x{:016x} strings ({} bytes)",
        summary.table_end,
        sp + stack.layout.required(),
        stack.layout.strings_size
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auxv::{AuxEntry, AuxVector};
    use crate::model::{ProgramHeaderTable, SegmentDescriptor, SegmentFlags, SegmentKind};
    use crate::stack::{build, validate, StackStrings};

    #[test]
    fn image_dump_lists_segments() {
        let image = ImageDescriptor {
            entry: 0x40_1000,
            segments: vec![SegmentDescriptor {
                virtual_start: 0x40_0000,
                file_offset: 0,
                file_size: 0x200,
                memory_size: 0x200,
                kind: SegmentKind::Load,
                permissions: SegmentFlags::READ | SegmentFlags::EXECUTE,
            }],
            program_headers: ProgramHeaderTable {
                offset: 64,
                count: 1,
                entry_size: 56,
                vaddr: None,
            },
        };
        let mut out = Vec::new();
        print_image(&mut out, &image, 0x1000).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("entry=0x0000000000401000\n"));
        assert!(text.contains("(not loaded)"));
        assert!(text.contains("segment[0] vaddr=0x0000000000400000"));
        assert!(text.contains("prot=R-X"));
    }

    #[test]
    fn stack_dump_follows_pointers() {
        let strings = StackStrings::copy_from(&["prog", "hello"], &["X=1"]).unwrap();
        let auxv = AuxVector::from_entries([AuxEntry { kind: 6, value: 4096 }]);
        let mut region = vec![0u8; 1024];
        let stack = build(&mut region, 0x700_0000, &strings, &auxv).unwrap();
        let view = StackView::new(0x700_0000, &region);
        let summary = validate(&view, stack.stack_pointer, &strings, &auxv).unwrap();

        let mut out = Vec::new();
        print_stack_image(&mut out, &view, &stack, &summary).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("argc 2"));
        assert!(text.contains("\"hello\""));
        assert!(text.contains("envp[0]"));
        assert!(text.contains("\"X=1\""));
        assert!(text.contains("auxv[1] type=0 value=0x0"));
    }
}
