//! Hand-off from the loader to the loaded program.

use crate::error::{LoaderError, Result};

/// Result of a successful transfer. It has no values: once control reaches
/// the program, nothing after [`enter`] runs.
#[derive(Debug)]
pub enum Transferred {}

/// Fails with `UnsupportedPlatform` where [`enter`] has no implementation.
pub fn ensure_supported() -> Result<()> {
    if cfg!(target_arch = "x86_64") {
        Ok(())
    } else {
        Err(LoaderError::UnsupportedPlatform {
            arch: std::env::consts::ARCH,
        })
    }
}

/// Switches to `stack_pointer` and jumps to `entry`.
///
/// `rdx` is cleared because the x86-64 process ABI reads it as a function
/// to register with `atexit`.
///
/// # Safety
///
/// `stack_pointer` must address a validated initial stack image and `entry`
/// must lie in mapped (or demand-paged) executable memory.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter(entry: u64, stack_pointer: u64) -> Result<Transferred> {
    log::info!("transferring control to {entry:#x} with rsp={stack_pointer:#x}");
    core::arch::asm!(
        "mov rsp, {stack}",
        "push {entry}",
        "xor eax, eax",
        "xor ebx, ebx",
        "xor ecx, ecx",
        "xor edx, edx",
        "xor esi, esi",
        "xor edi, edi",
        "xor ebp, ebp",
        "ret",
        stack = in(reg) stack_pointer,
        entry = in(reg) entry,
        options(noreturn)
    )
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn enter(_entry: u64, _stack_pointer: u64) -> Result<Transferred> {
    ensure_supported()?;
    Err(LoaderError::UnsupportedPlatform {
        arch: std::env::consts::ARCH,
    })
}
