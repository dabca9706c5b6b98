use super::Process;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_vm_shared::mem::VirtAddr;

pub type Tid = u16;

// Zero is never a valid user stack pointer, so it stands for "none recorded".
const NO_ESP: usize = 0;

pub struct ThreadControlBlock {
    tid: Tid,
    process: Arc<Process>,
    // The user stack pointer saved on entry to the current system call.
    syscall_esp: AtomicUsize,
}

impl ThreadControlBlock {
    pub fn new(tid: Tid, process: Arc<Process>) -> Self {
        Self {
            tid,
            process,
            syscall_esp: AtomicUsize::new(NO_ESP),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Called on system call entry, before the handler can touch user memory.
    pub fn record_syscall_esp(&self, esp: VirtAddr) {
        self.syscall_esp.store(esp.as_usize(), Ordering::Release);
    }

    pub fn clear_syscall_esp(&self) {
        self.syscall_esp.store(NO_ESP, Ordering::Release);
    }

    pub fn syscall_esp(&self) -> Option<VirtAddr> {
        match self.syscall_esp.load(Ordering::Acquire) {
            NO_ESP => None,
            esp => Some(VirtAddr::new(esp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{thread, vm};

    #[test]
    fn test_syscall_esp() {
        let vm = vm(1);
        let (thread, _dir) = thread(&vm);
        assert_eq!(thread.syscall_esp(), None);
        thread.record_syscall_esp(VirtAddr::new(0x7fff_fff0));
        assert_eq!(thread.syscall_esp(), Some(VirtAddr::new(0x7fff_fff0)));
        thread.clear_syscall_esp();
        assert_eq!(thread.syscall_esp(), None);
    }
}
