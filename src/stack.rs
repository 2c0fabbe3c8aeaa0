//! Initial process stack: builder and validator.
//!
//! Layout from the stack pointer upwards:
//!
//! ```text
//! argc | argv[0..argc] | 0 | envp[0..envc] | 0 | auxv pairs | AT_NULL, 0 | argument strings | environment strings
//! ```

use crate::arith::{align_down, checked_add, checked_mul, to_usize};
use crate::auxv::{AuxEntry, AuxVector};
use crate::consts::{AT_NULL, STACK_ALIGNMENT};
use crate::error::{LoaderError, Result};
use crate::memory::AddressSpace;
use crate::model::{ImageDescriptor, SegmentFlags};

const WORD: u64 = 8;
const AUX_ENTRY: u64 = 16;

/// Private copies of the argument and environment strings, without their
/// NUL terminators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackStrings {
    args: Vec<Vec<u8>>,
    env: Vec<Vec<u8>>,
}

fn copy_strings<T: AsRef<[u8]>>(strings: &[T], what: &'static str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    out.try_reserve_exact(strings.len()).map_err(|_| LoaderError::OutOfMemory {
        what,
        bytes: strings.len() * std::mem::size_of::<Vec<u8>>(),
    })?;
    for s in strings {
        let s = s.as_ref();
        // A C string ends at its first NUL.
        let s = s.iter().position(|b| *b == 0).map_or(s, |nul| &s[..nul]);
        let mut copy = Vec::new();
        copy.try_reserve_exact(s.len())
            .map_err(|_| LoaderError::OutOfMemory { what, bytes: s.len() })?;
        copy.extend_from_slice(s);
        out.push(copy);
    }
    Ok(out)
}

impl StackStrings {
    pub fn copy_from<A, E>(args: &[A], env: &[E]) -> Result<Self>
    where
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        Ok(Self {
            args: copy_strings(args, "argument strings")?,
            env: copy_strings(env, "environment strings")?,
        })
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn env(&self) -> &[Vec<u8>] {
        &self.env
    }

    fn all(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().chain(&self.env).map(Vec::as_slice)
    }
}

/// Sizes of the parts of a stack image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackLayout {
    pub argc: u64,
    pub envc: u64,
    /// Auxiliary entries, not counting the terminator.
    pub auxc: u64,
    /// argc, both pointer arrays and the auxiliary vector.
    pub table_size: u64,
    /// Every string including its NUL.
    pub strings_size: u64,
}

impl StackLayout {
    pub fn new(strings: &StackStrings, auxv: &AuxVector) -> Result<Self> {
        let argc = strings.args.len() as u64;
        let envc = strings.env.len() as u64;
        let auxc = auxv.len() as u64;

        let argv = checked_mul(argc + 1, WORD, "argv size")?;
        let envp = checked_mul(envc + 1, WORD, "envp size")?;
        let aux = checked_mul(auxc + 1, AUX_ENTRY, "auxv size")?;
        let table_size = checked_add(WORD + argv, envp, "stack table size")
            .and_then(|size| checked_add(size, aux, "stack table size"))?;

        let mut strings_size = 0u64;
        for s in strings.all() {
            strings_size = checked_add(strings_size, s.len() as u64 + 1, "stack string size")?;
        }

        Ok(Self {
            argc,
            envc,
            auxc,
            table_size,
            strings_size,
        })
    }

    pub fn required(&self) -> u64 {
        self.table_size + self.strings_size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitialStack {
    /// Address of `argc`; what `rsp` holds when the program starts.
    pub stack_pointer: u64,
    pub base: u64,
    pub size: u64,
    pub layout: StackLayout,
}

impl InitialStack {
    pub fn top(&self) -> u64 {
        self.base + self.size
    }
}

/// Bounds-checked writer over the stack region.
struct StackCursor<'a> {
    region: &'a mut [u8],
    pos: usize,
}

impl StackCursor<'_> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self
            .pos
            .checked_add(bytes.len())
            .filter(|end| *end <= self.region.len())
            .ok_or(LoaderError::StackOverflow {
                required: self.pos.saturating_add(bytes.len()) as u64,
                available: self.region.len() as u64,
            })?;
        self.region[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_ne_bytes())
    }

    fn put_cstr(&mut self, s: &[u8]) -> Result<()> {
        self.put_bytes(s)?;
        self.put_bytes(&[0])
    }
}

/// Maps a read/write region for the stack at `base`.
pub fn allocate<M: AddressSpace + ?Sized>(memory: &mut M, base: u64, size: u64) -> Result<&mut [u8]> {
    memory
        .map_zeroed(base, size, SegmentFlags::RW)
        .map_err(|err| match err {
            LoaderError::MapFailed { errno, .. } => LoaderError::StackAllocationFailed { base, size, errno },
            other => other,
        })
}

/// Fails with `StackAllocationFailed` (`EEXIST`) if `[base, base + size)`
/// touches a page of any loadable segment. Demand-paged segments are not
/// mapped yet, so the mapping itself cannot catch this.
pub fn ensure_clear_of_image(image: &ImageDescriptor, base: u64, size: u64, page_size: u64) -> Result<()> {
    let end = checked_add(base, size, "stack end")?;
    match image
        .segments
        .iter()
        .find(|seg| seg.page_start(page_size) < end && base < seg.page_end(page_size))
    {
        Some(seg) => {
            log::debug!(
                "stack {base:#x}..{end:#x} overlaps segment pages {:#x}..{:#x}",
                seg.page_start(page_size),
                seg.page_end(page_size)
            );
            Err(LoaderError::StackAllocationFailed {
                base,
                size,
                errno: libc::EEXIST,
            })
        }
        None => Ok(()),
    }
}

/// Writes the stack image into `region`, which is mapped at `base`, so that
/// it ends as close to the top of the region as alignment allows.
pub fn build(region: &mut [u8], base: u64, strings: &StackStrings, auxv: &AuxVector) -> Result<InitialStack> {
    let layout = StackLayout::new(strings, auxv)?;
    let size = region.len() as u64;
    let top = checked_add(base, size, "stack top")?;
    let required = layout.required();

    let sp = top
        .checked_sub(required)
        .map(|addr| align_down(addr, STACK_ALIGNMENT))
        .filter(|sp| *sp >= base)
        .ok_or(LoaderError::StackOverflow {
            required,
            available: size,
        })?;

    let mut cursor = StackCursor {
        region,
        pos: to_usize(sp - base, "stack offset")?,
    };

    let mut next_string = sp + layout.table_size;
    cursor.put_u64(layout.argc)?;
    for s in &strings.args {
        cursor.put_u64(next_string)?;
        next_string += s.len() as u64 + 1;
    }
    cursor.put_u64(0)?;
    for s in &strings.env {
        cursor.put_u64(next_string)?;
        next_string += s.len() as u64 + 1;
    }
    cursor.put_u64(0)?;
    for entry in auxv.entries() {
        cursor.put_u64(entry.kind)?;
        cursor.put_u64(entry.value)?;
    }
    cursor.put_u64(AT_NULL)?;
    cursor.put_u64(0)?;
    for s in strings.all() {
        cursor.put_cstr(s)?;
    }

    log::debug!(
        "stack image at {sp:#x}: argc={} envc={} auxc={} ({:#x} bytes)",
        layout.argc,
        layout.envc,
        layout.auxc,
        required
    );
    Ok(InitialStack {
        stack_pointer: sp,
        base,
        size,
        layout,
    })
}

/// Read-only view of a stack region mapped at `base`.
#[derive(Clone, Copy, Debug)]
pub struct StackView<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> StackView<'a> {
    pub fn new(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    fn offset(&self, addr: u64, len: u64) -> Result<usize> {
        let end = addr.checked_add(len);
        if addr < self.base || end.map_or(true, |end| end > self.base + self.bytes.len() as u64) {
            return Err(LoaderError::corrupt(format!(
                "address {addr:#x} outside the stack region {:#x}..{:#x}",
                self.base,
                self.base + self.bytes.len() as u64
            )));
        }
        Ok((addr - self.base) as usize)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let off = self.offset(addr, WORD)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[off..off + 8]);
        Ok(u64::from_ne_bytes(word))
    }

    /// The NUL-terminated string at `addr`, without its terminator.
    pub fn read_cstr(&self, addr: u64) -> Result<&'a [u8]> {
        let off = self.offset(addr, 1)?;
        let rest = &self.bytes[off..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| LoaderError::corrupt(format!("string at {addr:#x} runs off the stack region")))?;
        Ok(&rest[..len])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSummary {
    pub argc: u64,
    pub envc: u64,
    pub auxc: u64,
    /// One past the auxiliary-vector terminator; strings start here.
    pub table_end: u64,
}

/// Re-walks the image at `stack_pointer` and checks it against the inputs
/// it was built from.
pub fn validate(
    view: &StackView<'_>,
    stack_pointer: u64,
    strings: &StackStrings,
    auxv: &AuxVector,
) -> Result<StackSummary> {
    if stack_pointer % STACK_ALIGNMENT != 0 {
        return Err(LoaderError::corrupt(format!(
            "stack pointer {stack_pointer:#x} is not {STACK_ALIGNMENT}-byte aligned"
        )));
    }

    let argc = view.read_u64(stack_pointer)?;
    if argc != strings.args.len() as u64 {
        return Err(LoaderError::corrupt(format!(
            "argc is {argc}, expected {}",
            strings.args.len()
        )));
    }

    let mut pos = stack_pointer + WORD;
    let mut pointers = Vec::with_capacity(strings.args.len() + strings.env.len());
    for _ in 0..argc {
        pointers.push(view.read_u64(pos)?);
        pos += WORD;
    }
    if view.read_u64(pos)? != 0 {
        return Err(LoaderError::corrupt("argv is not null-terminated"));
    }
    pos += WORD;

    let mut envc = 0u64;
    loop {
        let ptr = view.read_u64(pos)?;
        pos += WORD;
        if ptr == 0 {
            break;
        }
        pointers.push(ptr);
        envc += 1;
    }
    if envc != strings.env.len() as u64 {
        return Err(LoaderError::corrupt(format!(
            "{envc} environment pointers, expected {}",
            strings.env.len()
        )));
    }

    let mut entries = Vec::with_capacity(auxv.len());
    loop {
        let kind = view.read_u64(pos)?;
        let value = view.read_u64(pos + WORD)?;
        pos += AUX_ENTRY;
        if kind == AT_NULL {
            if value != 0 {
                return Err(LoaderError::corrupt(format!(
                    "auxv terminator carries value {value:#x}"
                )));
            }
            break;
        }
        entries.push(AuxEntry { kind, value });
    }
    if entries.as_slice() != auxv.entries() {
        return Err(LoaderError::corrupt(format!(
            "auxv has {} entries that differ from the {} expected",
            entries.len(),
            auxv.len()
        )));
    }
    let table_end = pos;

    let mut expected_at = table_end;
    for (index, (ptr, expected)) in pointers.iter().zip(strings.all()).enumerate() {
        if *ptr != expected_at {
            return Err(LoaderError::corrupt(format!(
                "string {index} at {ptr:#x}, expected {expected_at:#x}"
            )));
        }
        let actual = view.read_cstr(*ptr)?;
        if actual != expected {
            return Err(LoaderError::corrupt(format!(
                "string {index} is {:?}, expected {:?}",
                String::from_utf8_lossy(actual),
                String::from_utf8_lossy(expected)
            )));
        }
        expected_at = ptr + actual.len() as u64 + 1;
    }

    Ok(StackSummary {
        argc,
        envc,
        auxc: entries.len() as u64,
        table_end,
    })
}
