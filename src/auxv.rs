//! The auxiliary vector handed to the loaded program.

use crate::consts::{AT_BASE, AT_ENTRY, AT_NULL, AT_PHDR, AT_PHENT, AT_PHNUM};
use crate::error::Result;
use crate::model::ImageDescriptor;

const AUXV_PATH: &str = "/proc/self/auxv";

/// One `(a_type, a_val)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuxEntry {
    pub kind: u64,
    pub value: u64,
}

/// Auxiliary-vector entries, without the `AT_NULL` terminator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuxVector {
    entries: Vec<AuxEntry>,
}

impl AuxVector {
    /// The vector the kernel gave this process.
    pub fn from_process() -> Result<Self> {
        let bytes = std::fs::read(AUXV_PATH)?;
        let auxv = Self::parse(&bytes);
        log::debug!("read {} auxv entries from {AUXV_PATH}", auxv.len());
        Ok(auxv)
    }

    /// Decodes native-endian pairs up to the first `AT_NULL` or the end of
    /// `bytes`, whichever comes first.
    pub fn parse(bytes: &[u8]) -> Self {
        let pairs = bytes.chunks_exact(16).map(|pair| {
            let mut kind = [0u8; 8];
            let mut value = [0u8; 8];
            kind.copy_from_slice(&pair[..8]);
            value.copy_from_slice(&pair[8..]);
            AuxEntry {
                kind: u64::from_ne_bytes(kind),
                value: u64::from_ne_bytes(value),
            }
        });
        Self::from_entries(pairs)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AuxEntry>) -> Self {
        Self {
            entries: entries.into_iter().take_while(|e| e.kind != AT_NULL).collect(),
        }
    }

    pub fn entries(&self) -> &[AuxEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, kind: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.kind == kind).map(|e| e.value)
    }

    /// Replaces the value of `kind`, appending the entry if it is missing.
    pub fn set(&mut self, kind: u64, value: u64) {
        match self.entries.iter_mut().find(|e| e.kind == kind) {
            Some(entry) => entry.value = value,
            None => self.entries.push(AuxEntry { kind, value }),
        }
    }

    /// Points the program-header and entry fields at `image` instead of the
    /// loader itself.
    pub fn patch_for_image(&mut self, image: &ImageDescriptor) {
        match image.program_headers.vaddr {
            Some(vaddr) => self.set(AT_PHDR, vaddr),
            None => log::warn!("program headers are not in a loaded segment; AT_PHDR left as is"),
        }
        self.set(AT_PHENT, image.program_headers.entry_size as u64);
        self.set(AT_PHNUM, image.program_headers.count as u64);
        self.set(AT_ENTRY, image.entry);
        self.set(AT_BASE, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::AT_PAGESZ;
    use crate::model::ProgramHeaderTable;

    fn encode(pairs: &[(u64, u64)]) -> Vec<u8> {
        pairs
            .iter()
            .flat_map(|(k, v)| k.to_ne_bytes().into_iter().chain(v.to_ne_bytes()))
            .collect()
    }

    #[test]
    fn parse_stops_at_terminator() {
        let bytes = encode(&[(AT_PAGESZ, 4096), (AT_ENTRY, 0x40_1000), (AT_NULL, 0), (AT_BASE, 9)]);
        let auxv = AuxVector::parse(&bytes);
        assert_eq!(auxv.len(), 2);
        assert_eq!(auxv.get(AT_PAGESZ), Some(4096));
        assert_eq!(auxv.get(AT_BASE), None);
    }

    #[test]
    fn parse_ignores_trailing_partial_pair() {
        let mut bytes = encode(&[(AT_PAGESZ, 4096)]);
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(AuxVector::parse(&bytes).len(), 1);
    }

    #[test]
    fn process_vector_reports_the_page_size() {
        let auxv = AuxVector::from_process().unwrap();
        assert!(!auxv.is_empty());
        assert_eq!(auxv.get(AT_PAGESZ), Some(crate::rt::page_size()));
    }

    #[test]
    fn patch_rewrites_image_fields() {
        let mut auxv = AuxVector::from_entries([
            AuxEntry {
                kind: AT_PHDR,
                value: 0x5555_0040,
            },
            AuxEntry {
                kind: AT_PAGESZ,
                value: 4096,
            },
            AuxEntry {
                kind: AT_BASE,
                value: 0x7fff_0000,
            },
        ]);
        let image = ImageDescriptor {
            entry: 0x40_1bc0,
            segments: Vec::new(),
            program_headers: ProgramHeaderTable {
                offset: 64,
                count: 10,
                entry_size: 56,
                vaddr: Some(0x40_0040),
            },
        };
        auxv.patch_for_image(&image);
        assert_eq!(auxv.get(AT_PHDR), Some(0x40_0040));
        assert_eq!(auxv.get(AT_PHENT), Some(56));
        assert_eq!(auxv.get(AT_PHNUM), Some(10));
        assert_eq!(auxv.get(AT_ENTRY), Some(0x40_1bc0));
        assert_eq!(auxv.get(AT_BASE), Some(0));
        assert_eq!(auxv.get(AT_PAGESZ), Some(4096));
        // Existing entries keep their slots; missing ones are appended.
        assert_eq!(auxv.entries()[0].kind, AT_PHDR);
        assert_eq!(auxv.len(), 6);
    }
}
