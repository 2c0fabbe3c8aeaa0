//! Address-space backends the mappers populate.

use std::collections::BTreeMap;

use crate::error::{LoaderError, Result};
use crate::model::SegmentFlags;
use crate::rt;

/// Somewhere to create fixed-address, zero-initialized mappings.
pub trait AddressSpace {
    /// Maps `len` zeroed bytes at the page-aligned `start` and hands them out
    /// for population. Fails with `MapFailed` if any part is already mapped.
    fn map_zeroed(&mut self, start: u64, len: u64, flags: SegmentFlags) -> Result<&mut [u8]>;

    fn protect(&mut self, start: u64, len: u64, flags: SegmentFlags) -> Result<()>;
}

/// The real address space of this process.
#[derive(Debug)]
pub struct ProcessMemory {
    page_size: u64,
}

impl ProcessMemory {
    pub fn new(page_size: u64) -> Self {
        Self { page_size }
    }
}

impl AddressSpace for ProcessMemory {
    fn map_zeroed(&mut self, start: u64, len: u64, flags: SegmentFlags) -> Result<&mut [u8]> {
        if len == 0 || start % self.page_size != 0 {
            return Err(LoaderError::MapFailed {
                address: start,
                len,
                errno: libc::EINVAL,
            });
        }
        let ptr = rt::mmap_fixed_anonymous(start, len, flags.prot()).map_err(|errno| LoaderError::MapFailed {
            address: start,
            len,
            errno,
        })?;
        // The mapping is never unmapped, so the slice stays valid for the
        // rest of the process.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len as usize) })
    }

    fn protect(&mut self, start: u64, len: u64, flags: SegmentFlags) -> Result<()> {
        rt::mprotect(start, len, flags.prot()).map_err(|errno| LoaderError::ProtectFailed {
            address: start,
            len,
            errno,
        })
    }
}

#[derive(Debug)]
struct Region {
    bytes: Vec<u8>,
    flags: SegmentFlags,
}

/// An in-memory model of an address space: page-granular regions with the
/// same overlap rules as `MAP_FIXED_NOREPLACE`.
#[derive(Debug)]
pub struct SparseMemory {
    page_size: u64,
    regions: BTreeMap<u64, Region>,
    protections: BTreeMap<u64, SegmentFlags>,
}

impl SparseMemory {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            regions: BTreeMap::new(),
            protections: BTreeMap::new(),
        }
    }

    fn region_for(&self, addr: u64) -> Option<(u64, &Region)> {
        let (&start, region) = self.regions.range(..=addr).next_back()?;
        (addr < start + region.bytes.len() as u64).then_some((start, region))
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.region_for(addr).is_some()
    }

    pub fn read_byte(&self, addr: u64) -> Option<u8> {
        let (start, region) = self.region_for(addr)?;
        Some(region.bytes[(addr - start) as usize])
    }

    /// Copies `len` bytes at `addr`, or `None` if any of them is unmapped.
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        (0..len as u64).map(|i| self.read_byte(addr + i)).collect()
    }

    /// Effective protection of the page holding `addr`.
    pub fn protection(&self, addr: u64) -> Option<SegmentFlags> {
        let page = addr - addr % self.page_size;
        if let Some(flags) = self.protections.get(&page) {
            return Some(*flags);
        }
        self.region_for(addr).map(|(_, region)| region.flags)
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> u64 {
        self.regions
            .values()
            .map(|r| r.bytes.len() as u64 / self.page_size)
            .sum()
    }
}

impl AddressSpace for SparseMemory {
    fn map_zeroed(&mut self, start: u64, len: u64, flags: SegmentFlags) -> Result<&mut [u8]> {
        let map_failed = |errno| LoaderError::MapFailed {
            address: start,
            len,
            errno,
        };
        if len == 0 || start % self.page_size != 0 {
            return Err(map_failed(libc::EINVAL));
        }
        let rounded = len
            .checked_add(self.page_size - 1)
            .map(|v| v - v % self.page_size)
            .ok_or_else(|| map_failed(libc::ENOMEM))?;
        let end = start.checked_add(rounded).ok_or_else(|| map_failed(libc::ENOMEM))?;

        let overlaps = self
            .regions
            .range(..end)
            .next_back()
            .is_some_and(|(&s, r)| s + r.bytes.len() as u64 > start);
        if overlaps {
            return Err(map_failed(libc::EEXIST));
        }

        let region = Region {
            bytes: vec![0u8; rounded as usize],
            flags,
        };
        let region = self.regions.entry(start).or_insert(region);
        Ok(&mut region.bytes[..len as usize])
    }

    fn protect(&mut self, start: u64, len: u64, flags: SegmentFlags) -> Result<()> {
        let mut page = start - start % self.page_size;
        while page < start + len {
            if !self.is_mapped(page) {
                return Err(LoaderError::ProtectFailed {
                    address: start,
                    len,
                    errno: libc::ENOMEM,
                });
            }
            self.protections.insert(page, flags);
            page += self.page_size;
        }
        Ok(())
    }
}
