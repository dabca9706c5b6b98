// https://wiki.osdev.org/Exceptions#Page_Fault

use crate::mem::{ErrorClass, Page, PageKind, SupplementalPageTable, VmConfig, VmError};
use crate::threading::ThreadControlBlock;
use alloc::sync::Arc;
use bitbybit::bitfield;
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use kidneyos_vm_shared::mem::VirtAddr;
use log::{debug, error, trace, warn};
use thiserror::Error;

/// The error code the CPU pushes for a page fault.
#[bitfield(u32, default = 0)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    // Set for a protection violation, clear for a not-present page.
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub write: bool,
    // Set if the access came from user mode.
    #[bit(2, rw)]
    pub user: bool,
}

impl fmt::Debug for PageFaultErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in {} mode",
            if self.present() { "protection violation" } else { "not present" },
            if self.write() { "writing" } else { "reading" },
            if self.user() { "user" } else { "kernel" },
        )
    }
}

/// What the fault handler captured before interrupts were re-enabled.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting address, from `cr2`.
    pub addr: VirtAddr,
    pub error_code: PageFaultErrorCode,
    /// The stack pointer at the time of the fault, if the CPU saved a user one.
    pub esp: Option<VirtAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminationReason {
    #[error("address is outside user space")]
    OutOfRange,
    #[error("protection violation")]
    ProtectionViolation,
    #[error("no page at address")]
    NoDescriptor,
    #[error("could not load page: {0}")]
    ClaimFailed(VmError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page is now mapped; retry the faulting instruction.
    Resume,
    /// The process has been made to exit.
    Terminate(TerminationReason),
}

/// Decides what each page fault means and resolves it.
#[derive(Debug, Default)]
pub struct PageFaultResolver {
    faults: AtomicUsize,
}

impl PageFaultResolver {
    pub const fn new() -> Self {
        Self {
            faults: AtomicUsize::new(0),
        }
    }

    /// Number of faults handled so far.
    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    /// Resolves `fault`, taken by `thread`.
    ///
    /// Panics on a kernel fault on a kernel address, and when every user
    /// frame is pinned. Any other failure makes the thread's process exit
    /// with status -1.
    pub fn handle(&self, thread: &ThreadControlBlock, fault: PageFault) -> FaultResolution {
        self.faults.fetch_add(1, Ordering::Relaxed);
        let process = thread.process();
        let spt = process.spt();
        let PageFault {
            addr, error_code, ..
        } = fault;

        let esp = if error_code.user() {
            fault.esp.or_else(|| thread.syscall_esp())
        } else if spt.mmu().is_user_vaddr(addr) {
            // The kernel was touching user memory for a system call; the
            // saved user stack pointer is what the stack test needs.
            thread.syscall_esp().or(fault.esp)
        } else {
            error!("page fault: {error_code:?} at {addr} in thread {}", thread.tid());
            panic!(
                "page fault with error code {:#b} occurred when trying to access {addr}",
                error_code.raw_value()
            );
        };

        match resolve(spt, addr, error_code, esp) {
            Ok(()) => FaultResolution::Resume,
            Err(reason) => {
                warn!(
                    "page fault: {}: {error_code:?} at {addr}: {reason}",
                    process.name()
                );
                process.exit(-1);
                FaultResolution::Terminate(reason)
            }
        }
    }
}

fn resolve(
    spt: &SupplementalPageTable,
    addr: VirtAddr,
    error_code: PageFaultErrorCode,
    esp: Option<VirtAddr>,
) -> Result<(), TerminationReason> {
    if !spt.mmu().is_user_vaddr(addr) {
        return Err(TerminationReason::OutOfRange);
    }
    if error_code.present() {
        return Err(TerminationReason::ProtectionViolation);
    }

    if esp.is_some_and(|esp| is_stack_access(spt.vm().config(), addr, esp)) {
        match spt.declare(PageKind::Stack, addr, true) {
            Ok(page) => {
                debug!("page fault: growing stack to {}", page.upage());
                return claim(spt, &page);
            }
            // Another thread grew the stack first.
            Err(VmError::AlreadyMapped(_)) => {}
            Err(err) => return Err(TerminationReason::ClaimFailed(err)),
        }
    }

    let page = spt.find(addr).ok_or(TerminationReason::NoDescriptor)?;
    if error_code.write() && !page.writable() {
        return Err(TerminationReason::ProtectionViolation);
    }
    trace!("page fault: loading {} ({:?})", page.upage(), page.kind());
    claim(spt, &page)
}

fn claim(spt: &SupplementalPageTable, page: &Arc<Page>) -> Result<(), TerminationReason> {
    spt.claim(page).map_err(|err| match err.class() {
        ErrorClass::KernelInvariantViolation => {
            error!("page fault: could not load {}: {err}", page.upage());
            panic!("page fault on {}: {err}", page.upage());
        }
        _ => TerminationReason::ClaimFailed(err),
    })
}

/// Whether a fault at `addr` looks like a push or a stack frame setup.
///
/// `pusha` faults 32 bytes below `esp` before updating it, so anything from
/// there up counts, as long as the stack stays within its size limit.
fn is_stack_access(config: &VmConfig, addr: VirtAddr, esp: VirtAddr) -> bool {
    addr.as_usize().saturating_add(config.stack_heuristic) >= esp.as_usize()
        && addr < config.user_top
        && config.user_top - addr.page_round_down() <= config.max_stack_size
}
