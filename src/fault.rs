//! `SIGSEGV` adapter that feeds faults into a [`DemandPager`].

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::demand::{DemandPager, Fault, FaultKind};
use crate::error::{LoaderError, Result};
use crate::memory::ProcessMemory;
use crate::rt;
use crate::source::FdSource;

/// Pager the installed handler resolves against.
pub type ProcessPager = DemandPager<FdSource, ProcessMemory>;

const ALT_STACK_SIZE: u64 = 64 * 1024;
// `libc` exports `SEGV_ACCERR` for Hurd and AIX only, not Linux.
const SEGV_ACCERR: i32 = 2;

static PAGER: AtomicPtr<ProcessPager> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_fault(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let pager = PAGER.load(Ordering::Acquire);
    if pager.is_null() || info.is_null() {
        rt::exit_now(1);
    }
    // SAFETY: the kernel hands us a valid siginfo; the pager was leaked in
    // `install` and only this handler touches it afterwards.
    let (address, code) = unsafe { ((*info).si_addr() as u64, (*info).si_code) };
    let kind = if code == SEGV_ACCERR {
        FaultKind::Permission
    } else {
        FaultKind::Unmapped
    };
    let pager = unsafe { &mut *pager };
    if let Err(err) = pager.resolve(Fault { address, kind }) {
        log::error!("{err}");
        rt::exit_now(1);
    }
}

fn install_alt_stack() -> Result<()> {
    let base = rt::mmap_anonymous(ALT_STACK_SIZE).map_err(|errno| LoaderError::HandlerInstall { errno })?;
    let stack = libc::stack_t {
        ss_sp: base.cast(),
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE as usize,
    };
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        return Err(LoaderError::HandlerInstall { errno: rt::last_errno() });
    }
    Ok(())
}

/// Hands `pager` to a process-wide `SIGSEGV` handler for the rest of the
/// process lifetime.
pub fn install(pager: ProcessPager) -> Result<()> {
    install_alt_stack()?;

    let leaked = Box::into_raw(Box::new(pager));
    PAGER.store(leaked, Ordering::Release);

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_fault as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    if unsafe { libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) } != 0 {
        let errno = rt::last_errno();
        PAGER.store(ptr::null_mut(), Ordering::Release);
        // SAFETY: the handler was never installed, so nothing else holds it.
        drop(unsafe { Box::from_raw(leaked) });
        return Err(LoaderError::HandlerInstall { errno });
    }

    log::debug!("SIGSEGV handler installed with a {ALT_STACK_SIZE:#x}-byte alternate stack");
    Ok(())
}
