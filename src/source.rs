use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::{LoaderError, Result};
use crate::rt;

/// Positioned reads from an executable image.
pub trait ImageSource {
    /// Reads at most `buf.len()` bytes at `offset`; `Ok(0)` means end of image.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<usize, i32>;

    /// Reads until `buf` is full or the image ends, returning the byte count.
    fn read_full_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<usize, i32> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = self.read_at(offset.saturating_add(done as u64), &mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }
}

/// An opened file read through raw `pread64`, usable from the fault handler.
#[derive(Debug)]
pub struct FdSource {
    file: File,
}

impl FdSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| LoaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { file })
    }
}

impl ImageSource for FdSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<usize, i32> {
        rt::pread(self.file.as_raw_fd(), buf, offset)
    }
}

impl ImageSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<usize, i32> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ImageSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<usize, i32> {
        self.as_slice().read_at(offset, buf)
    }
}

/// Fills `dst` from `offset`, failing with `SegmentReadFailed` on any shortfall.
pub fn read_segment_bytes<S: ImageSource + ?Sized>(source: &S, offset: u64, dst: &mut [u8]) -> Result<()> {
    let expected = dst.len();
    match source.read_full_at(offset, dst) {
        Ok(actual) if actual == expected => Ok(()),
        Ok(actual) => Err(LoaderError::SegmentReadFailed {
            offset,
            expected,
            actual,
        }),
        Err(errno) => {
            log::debug!("pread at {offset:#x} failed with errno {errno}");
            Err(LoaderError::SegmentReadFailed {
                offset,
                expected,
                actual: 0,
            })
        }
    }
}
