use crate::mem::SupplementalPageTable;
use alloc::{boxed::Box, string::String};
use log::info;
use once_cell::race::OnceBox;

pub type Pid = u16;

/// A user process: a name and the address space its threads share.
pub struct Process {
    pid: Pid,
    name: String,
    spt: SupplementalPageTable,
    exit_status: OnceBox<i32>,
}

impl Process {
    pub fn new(pid: Pid, name: impl Into<String>, spt: SupplementalPageTable) -> Self {
        Self {
            pid,
            name: name.into(),
            spt,
            exit_status: OnceBox::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// The status passed to the first [`Process::exit`], if it has exited.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status.get().copied()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status.get().is_some()
    }

    /// Records `status` and releases the address space.
    ///
    /// Returns `false` if the process had already exited, in which case
    /// nothing happens.
    pub fn exit(&self, status: i32) -> bool {
        if self.exit_status.set(Box::new(status)).is_err() {
            return false;
        }
        info!("{}: exit({})", self.name, status);
        self.spt.destroy();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PageKind;
    use crate::test_utils::{address_space, vm};
    use kidneyos_vm_shared::mem::VirtAddr;

    #[test]
    fn test_exit_once() {
        let vm = vm(2);
        let (spt, _dir) = address_space(&vm);
        let page = spt
            .declare(PageKind::Anonymous, VirtAddr::new(0x1000), true)
            .expect("declare");
        spt.claim(&page).expect("claim");

        let process = Process::new(3, "args-none", spt);
        assert_eq!(process.exit_status(), None);
        assert!(process.exit(-1));
        assert!(!process.exit(0));
        assert_eq!(process.exit_status(), Some(-1));
        assert!(process.spt().is_empty());
        assert_eq!(vm.frames().frames_allocated(), 0);
    }
}
