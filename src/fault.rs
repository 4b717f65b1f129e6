//! Fault Interceptor.
//!
//! Installs a process-wide `SIGSEGV`/`SIGBUS` handler over the shared
//! region once per process, discriminates read faults from write faults
//! using the CPU error code pushed onto the signal frame, and dispatches
//! synchronously, on the faulting thread, to the coherence engine before
//! returning control to the faulting instruction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::memregion::MemoryRegion;

/// Enforces that at most one [`FaultInterceptor`] is ever installed in a
/// process; a second install is a programming error, not a recoverable
/// condition.
static DOUBLE_INSTALL: AtomicBool = AtomicBool::new(false);

/// The engine the process-wide signal handler dispatches into. Signal
/// handlers cannot carry closures or captured state, so the engine lives
/// here instead, set exactly once by [`FaultInterceptor::install`].
static ENGINE: OnceLock<&'static Engine> = OnceLock::new();

/// x86-64 page-fault error code bit: set when the fault was a write.
///
/// Mirrors the `PF_WRITE` discrimination the original performs on its
/// `userfaultfd` page-fault event flags before dispatching to its
/// read/write fault handlers.
const PF_WRITE_BIT: u64 = 1 << 1;

/// Handle to the installed process-wide trap. Dropping it does not
/// uninstall the handler. Per the design, the trap lives for the life of
/// the process once installed.
pub struct FaultInterceptor {
    _private: (),
}

impl FaultInterceptor {
    /// Installs the `SIGSEGV` and `SIGBUS` handlers over `region`, routing
    /// faults inside it to `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleInstall`] if called more than once in this
    /// process. Returns [`Error::OsSignal`] if `sigaction` itself fails.
    ///
    /// # Safety
    ///
    /// `engine` and `region` must outlive every subsequent fault in this
    /// process, since the handler dereferences them for the remaining
    /// life of the process. Callers satisfy this by leaking a `&'static
    /// Engine` built once at node startup.
    pub unsafe fn install(engine: &'static Engine) -> Result<Self> {
        if DOUBLE_INSTALL.swap(true, Ordering::SeqCst) {
            return Err(Error::DoubleInstall);
        }

        ENGINE
            .set(engine)
            .map_err(|_| Error::BadState("engine already set".to_owned()))?;

        let action = SigAction::new(
            SigHandler::SigAction(handle_fault),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );

        // SAFETY: installing a process-wide signal handler is inherently
        // unsafe; `handle_fault` only touches `ENGINE` (set above) and
        // async-signal-unsafe-free coherence-engine paths documented on
        // `Engine::on_read_fault`/`on_write_fault`.
        unsafe {
            signal::sigaction(Signal::SIGSEGV, &action)
                .map_err(|e| Error::OsSignal(e.to_string()))?;
            signal::sigaction(Signal::SIGBUS, &action)
                .map_err(|e| Error::OsSignal(e.to_string()))?;
        }

        Ok(Self { _private: () })
    }
}

/// The actual signal handler, installed with `SA_SIGINFO` so the kernel
/// passes a `siginfo_t` and a `ucontext_t` alongside the signal number.
///
/// # Panics
///
/// Panics (aborting the process, since this runs on the signal stack) if
/// no engine was installed, or if the faulting address falls outside the
/// shared region. The latter indicates a fault this crate has no
/// business intercepting, and re-raising the default disposition would be
/// more correct in a production trap but is out of scope here.
extern "C" fn handle_fault(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let engine = ENGINE.get().expect("fault handler invoked before install");

    // SAFETY: `info` is valid for the duration of the handler per the
    // `sigaction(2)` contract when `SA_SIGINFO` is set.
    let fault_addr = unsafe { (*info).si_addr() } as usize;

    if !engine.region().contains(fault_addr) {
        // Not one of ours; there is nothing sensible to do but stop.
        panic!("fault at {fault_addr:#x} (signal {signum}) outside the shared region");
    }

    let page_addr = MemoryRegion::page_align_down(fault_addr);
    let is_write = write_bit_set(ctx);

    let result = if is_write {
        engine.on_write_fault(page_addr)
    } else {
        engine.on_read_fault(page_addr)
    };

    if let Err(err) = result {
        panic!("unrecoverable coherence failure servicing fault at {page_addr:#x}: {err}");
    }
}

/// Reads the write/read discrimination bit out of the platform-specific
/// `ucontext_t` passed to the handler.
///
/// # Safety
///
/// `ctx` must be the `ucontext_t*` the kernel supplied to this signal
/// handler.
#[cfg(target_arch = "x86_64")]
fn write_bit_set(ctx: *mut libc::c_void) -> bool {
    // SAFETY: `ctx` is the `ucontext_t*` supplied by the kernel to an
    // `SA_SIGINFO` handler on this platform; `gregs[REG_ERR]` holds the
    // CPU page-fault error code.
    unsafe {
        let ucontext = ctx.cast::<libc::ucontext_t>();
        let err = (*ucontext).uc_mcontext.gregs[libc::REG_ERR as usize];
        (err as u64) & PF_WRITE_BIT != 0
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn write_bit_set(_ctx: *mut libc::c_void) -> bool {
    compile_error!("fault discrimination is only implemented for x86_64");
}
