//! Host fault routing for fastmem (Linux x86_64)
//!
//! One process-wide `SIGSEGV`/`SIGBUS` handler forwards faults to the active
//! [`FaultContext`]. Faults it does not fix are chained to whatever handler
//! was installed before, or re-raised with the default action.
//!
//! The handler is not async-signal-safe. It locks the context's backpatch
//! state and logs through `log`, so a fault must never be raised while the
//! faulting thread holds that lock or is inside the logger. Embedders that
//! install a logger taking a global lock should keep JIT threads from
//! logging while guest code runs.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use log::{debug, error};

use super::backpatch::{FaultContext, FaultOutcome};
use crate::error::ArenaError;

static ACTIVE: AtomicPtr<FaultContext> = AtomicPtr::new(ptr::null_mut());
static PREVIOUS: OnceLock<Result<SavedActions, i32>> = OnceLock::new();

struct SavedActions {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

// SAFETY: written once before the handler can run, read-only afterwards.
unsafe impl Send for SavedActions {}
unsafe impl Sync for SavedActions {}

/// Installs the process-wide handler. Later calls are no-ops.
pub fn install() -> Result<(), ArenaError> {
    match PREVIOUS.get_or_init(|| unsafe { install_handlers() }) {
        Ok(_) => Ok(()),
        Err(errno) => Err(ArenaError::Os {
            op: "install fastmem fault handler",
            source: std::io::Error::from_raw_os_error(*errno),
        }),
    }
}

unsafe fn install_handlers() -> Result<SavedActions, i32> {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = on_fault as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);

    let mut segv: libc::sigaction = std::mem::zeroed();
    let mut bus: libc::sigaction = std::mem::zeroed();
    if libc::sigaction(libc::SIGSEGV, &action, &mut segv) != 0
        || libc::sigaction(libc::SIGBUS, &action, &mut bus) != 0
    {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
    }
    debug!("fastmem fault handler installed");
    Ok(SavedActions { segv, bus })
}

/// Routes fastmem faults to `ctx` until [`deactivate`] is called with it.
///
/// # Safety
///
/// `ctx` must stay alive until it is deactivated.
pub unsafe fn activate(ctx: &FaultContext) {
    let previous = ACTIVE.swap(ctx as *const FaultContext as *mut FaultContext, Ordering::AcqRel);
    if !previous.is_null() && previous as *const FaultContext != ctx as *const FaultContext {
        debug!("fastmem fault route moved to a new address space");
    }
}

/// Stops routing to `ctx` if it is still the active context.
pub fn deactivate(ctx: &FaultContext) {
    let ptr = ctx as *const FaultContext as *mut FaultContext;
    let _ = ACTIVE.compare_exchange(ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire);
}

pub fn is_active(ctx: &FaultContext) -> bool {
    ptr::eq(ACTIVE.load(Ordering::Acquire), ctx)
}

extern "C" fn on_fault(sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    unsafe {
        let ctx = ACTIVE.load(Ordering::Acquire);
        if !ctx.is_null() && !info.is_null() && !uctx.is_null() {
            let fault_addr = (*info).si_addr() as usize;
            let ucontext = uctx as *mut libc::ucontext_t;
            let host_pc = (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
            match (*ctx).handle_fault(host_pc, fault_addr) {
                FaultOutcome::Patched { .. } => return,
                FaultOutcome::Unhandled => {
                    error!("unrecoverable fastmem fault at host pc {:#x}", host_pc);
                }
                FaultOutcome::NotFastmem => {}
            }
        }
        chain(sig, info, uctx);
    }
}

unsafe fn chain(sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    let previous = match PREVIOUS.get() {
        Some(Ok(saved)) if sig == libc::SIGBUS => &saved.bus,
        Some(Ok(saved)) => &saved.segv,
        _ => return restore_default(sig),
    };
    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        return restore_default(sig);
    }
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = std::mem::transmute(handler);
        f(sig, info, uctx);
    } else {
        let f: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
        f(sig);
    }
}

/// Resets `sig` to its default action; returning re-executes the faulting
/// instruction, which then takes the default action.
unsafe fn restore_default(sig: libc::c_int) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(sig, &action, ptr::null_mut());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastmem::codegen::DispatchOnlyCodegen;

    #[test]
    fn test_activation_is_scoped_to_context() {
        install().unwrap();
        let a = FaultContext::new(0x1000, 0x1000, Box::new(DispatchOnlyCodegen));
        let b = FaultContext::new(0x1000, 0x1000, Box::new(DispatchOnlyCodegen));
        unsafe { activate(&a) };
        assert!(is_active(&a));
        unsafe { activate(&b) };
        deactivate(&a);
        assert!(is_active(&b));
        deactivate(&b);
        assert!(!is_active(&b));
    }
}
