//! Thin wrappers over the system calls the loader issues.
//!
//! Everything reachable from the fault handler goes through [`syscall6`],
//! which on x86-64 is a bare `syscall` instruction. Once the target program
//! owns the thread, the `fs` base points at *its* thread control block, so
//! the host libc wrappers (errno, cancellation checks) must stay out of that
//! path.

use std::ffi::c_long;
use std::io;

use crate::consts::FALLBACK_PAGE_SIZE;

pub const PROT_NONE: i32 = libc::PROT_NONE;
pub const PROT_READ: i32 = libc::PROT_READ;
pub const PROT_WRITE: i32 = libc::PROT_WRITE;
pub const PROT_EXEC: i32 = libc::PROT_EXEC;
pub const PROT_RW: i32 = PROT_READ | PROT_WRITE;
pub const PROT_RWX: i32 = PROT_READ | PROT_WRITE | PROT_EXEC;

const MAP_FIXED_NOREPLACE: i32 = 0x10_0000;
const MAX_ERRNO: i64 = 4095;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn syscall6(nr: c_long, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let ret: i64;
    core::arch::asm!(
        "syscall",
        inlateout("rax") nr as i64 => ret,
        in("rdi") a0,
        in("rsi") a1,
        in("rdx") a2,
        in("r10") a3,
        in("r8") a4,
        in("r9") a5,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );
    ret
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
unsafe fn syscall6(nr: c_long, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let ret = libc::syscall(nr, a0, a1, a2, a3, a4, a5) as i64;
    if ret == -1 {
        -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
    } else {
        ret
    }
}

/// Splits a raw kernel return into a value or a positive errno.
fn check(ret: i64) -> Result<u64, i32> {
    if (-MAX_ERRNO..0).contains(&ret) {
        Err((-ret) as i32)
    } else {
        Ok(ret as u64)
    }
}

pub fn page_size() -> u64 {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        log::warn!("sysconf(_SC_PAGESIZE) failed, assuming {FALLBACK_PAGE_SIZE}");
        FALLBACK_PAGE_SIZE
    } else {
        value as u64
    }
}

pub fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Maps `len` zero-filled bytes at exactly `addr`.
///
/// Never replaces an existing mapping: an occupied range fails with `EEXIST`.
pub fn mmap_fixed_anonymous(addr: u64, len: u64, prot: i32) -> Result<*mut u8, i32> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_FIXED_NOREPLACE;
    let ret = unsafe {
        syscall6(
            libc::SYS_mmap,
            addr,
            len,
            prot as u64,
            flags as u64,
            u64::MAX, // fd = -1
            0,
        )
    };
    let mapped = check(ret)?;
    if mapped != addr {
        // Kernels older than 4.17 read MAP_FIXED_NOREPLACE as a mere hint.
        let _ = munmap(mapped, len);
        return Err(libc::EEXIST);
    }
    Ok(mapped as *mut u8)
}

/// Maps `len` zero-filled read/write bytes wherever the kernel likes.
pub fn mmap_anonymous(len: u64) -> Result<*mut u8, i32> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let ret = unsafe {
        syscall6(
            libc::SYS_mmap,
            0,
            len,
            PROT_RW as u64,
            flags as u64,
            u64::MAX,
            0,
        )
    };
    check(ret).map(|addr| addr as *mut u8)
}

pub fn mprotect(addr: u64, len: u64, prot: i32) -> Result<(), i32> {
    let ret = unsafe { syscall6(libc::SYS_mprotect, addr, len, prot as u64, 0, 0, 0) };
    check(ret).map(|_| ())
}

pub fn munmap(addr: u64, len: u64) -> Result<(), i32> {
    let ret = unsafe { syscall6(libc::SYS_munmap, addr, len, 0, 0, 0, 0) };
    check(ret).map(|_| ())
}

/// One `pread64`, retried on `EINTR`. Returns the byte count the kernel gave.
pub fn pread(fd: i32, buf: &mut [u8], offset: u64) -> Result<usize, i32> {
    loop {
        let ret = unsafe {
            syscall6(
                libc::SYS_pread64,
                fd as u64,
                buf.as_mut_ptr() as u64,
                buf.len() as u64,
                offset,
                0,
                0,
            )
        };
        match check(ret) {
            Err(libc::EINTR) => continue,
            other => return other.map(|n| n as usize),
        }
    }
}

/// Writes all of `bytes` to stderr, giving up silently on error.
pub fn write_stderr(bytes: &[u8]) {
    let mut done = 0usize;
    while done < bytes.len() {
        let rest = &bytes[done..];
        let ret = unsafe {
            syscall6(
                libc::SYS_write,
                libc::STDERR_FILENO as u64,
                rest.as_ptr() as u64,
                rest.len() as u64,
                0,
                0,
                0,
            )
        };
        match check(ret) {
            Ok(0) => return,
            Ok(n) => done += n as usize,
            Err(libc::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Terminates the whole process without running any user-space cleanup.
pub fn exit_now(code: i32) -> ! {
    unsafe {
        syscall6(libc::SYS_exit_group, code as u64, 0, 0, 0, 0, 0);
        libc::_exit(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn anonymous_mappings_read_as_zero() {
        let len = page_size();
        let ptr = mmap_anonymous(len).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
        assert!(bytes.iter().all(|b| *b == 0));
        munmap(ptr as u64, len).unwrap();
    }

    #[test]
    fn fixed_mapping_refuses_occupied_range() {
        let len = page_size();
        let ptr = mmap_anonymous(len).unwrap();
        assert_eq!(
            mmap_fixed_anonymous(ptr as u64, len, PROT_RW),
            Err(libc::EEXIST)
        );
        munmap(ptr as u64, len).unwrap();
    }

    #[test]
    fn pread_reports_bad_descriptor() {
        let mut buf = [0u8; 8];
        assert_eq!(pread(-1, &mut buf, 0), Err(libc::EBADF));
    }
}
