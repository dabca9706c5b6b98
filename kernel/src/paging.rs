use crate::interrupts::PageFaultErrorCode;
use crate::mem::{FrameId, VmError};
use crate::sync::Mutex;
use alloc::{collections::BTreeMap, vec::Vec};
use kidneyos_vm_shared::{mem::VirtAddr, paging::PageTableEntry};

/// Address translation for one address space.
///
/// Implementations must keep the accessed and dirty bits of a page readable
/// after [`Mmu::unmap`], the way x86 leaves them in a non-present entry.
pub trait Mmu: Send + Sync {
    /// Maps `upage` to `frame`. Fails if `upage` is already mapped.
    fn map(&self, upage: VirtAddr, frame: FrameId, writable: bool) -> Result<(), VmError>;

    fn unmap(&self, upage: VirtAddr);

    fn translate(&self, upage: VirtAddr) -> Option<FrameId>;

    fn is_accessed(&self, upage: VirtAddr) -> bool;

    fn set_accessed(&self, upage: VirtAddr, accessed: bool);

    fn is_dirty(&self, upage: VirtAddr) -> bool;

    fn set_dirty(&self, upage: VirtAddr, dirty: bool);

    fn is_user_vaddr(&self, addr: VirtAddr) -> bool {
        addr.is_user()
    }
}

/// A page directory kept in kernel memory, with the accessed and dirty bits
/// maintained by [`PageDirectory::access`] instead of by the CPU.
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<BTreeMap<VirtAddr, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs the checks the CPU makes on a memory access to `va`, and sets
    /// the accessed and dirty bits on success.
    ///
    /// Returns the error code of the page fault the access would raise.
    pub fn access(
        &self,
        va: VirtAddr,
        write: bool,
        user: bool,
    ) -> Result<FrameId, PageFaultErrorCode> {
        let code = PageFaultErrorCode::DEFAULT
            .with_write(write)
            .with_user(user);
        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(&va.page_round_down())
            .filter(|entry| entry.present())
        else {
            return Err(code);
        };
        if (write && !entry.read_write()) || (user && !entry.user_supervisor()) {
            return Err(code.with_present(true));
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        Ok(FrameId::new(entry.frame_number()))
    }

    /// Pages with a present mapping, in address order.
    pub fn mapped_pages(&self) -> Vec<VirtAddr> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.present())
            .map(|(&upage, _)| upage)
            .collect()
    }

    fn update(&self, upage: VirtAddr, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.lock().get_mut(&upage) {
            *entry = f(*entry);
        }
    }

    fn read(&self, upage: VirtAddr, f: impl FnOnce(PageTableEntry) -> bool) -> bool {
        self.entries.lock().get(&upage).is_some_and(|&entry| f(entry))
    }
}

impl Mmu for PageDirectory {
    fn map(&self, upage: VirtAddr, frame: FrameId, writable: bool) -> Result<(), VmError> {
        debug_assert!(upage.is_page_aligned());
        let mut entries = self.entries.lock();
        if entries.get(&upage).is_some_and(|entry| entry.present()) {
            return Err(VmError::MapFailed(upage));
        }
        let entry = PageTableEntry::user_mapping(frame.index(), writable)
            .ok_or(VmError::MapFailed(upage))?;
        entries.insert(upage, entry);
        Ok(())
    }

    fn unmap(&self, upage: VirtAddr) {
        self.update(upage, |entry| entry.with_present(false));
    }

    fn translate(&self, upage: VirtAddr) -> Option<FrameId> {
        self.entries
            .lock()
            .get(&upage.page_round_down())
            .filter(|entry| entry.present())
            .map(|entry| FrameId::new(entry.frame_number()))
    }

    fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.read(upage, |entry| entry.accessed())
    }

    fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
        self.update(upage, |entry| entry.with_accessed(accessed));
    }

    fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.read(upage, |entry| entry.dirty())
    }

    fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
        self.update(upage, |entry| entry.with_dirty(dirty));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: VirtAddr = VirtAddr::new(0x0804_8000);

    #[test]
    fn test_map_translate_unmap() {
        let dir = PageDirectory::new();
        dir.map(PAGE, FrameId::new(7), true).expect("unmapped");
        assert_eq!(dir.translate(PAGE + 0x123), Some(FrameId::new(7)));
        assert_eq!(
            dir.map(PAGE, FrameId::new(8), true),
            Err(VmError::MapFailed(PAGE))
        );
        assert_eq!(dir.mapped_pages(), [PAGE]);

        dir.unmap(PAGE);
        assert_eq!(dir.translate(PAGE), None);
        assert!(dir.mapped_pages().is_empty());
        dir.map(PAGE, FrameId::new(8), false).expect("unmapped");
    }

    #[test]
    fn test_access_sets_bits() {
        let dir = PageDirectory::new();
        dir.map(PAGE, FrameId::new(1), true).expect("unmapped");
        assert!(!dir.is_accessed(PAGE) && !dir.is_dirty(PAGE));

        assert_eq!(dir.access(PAGE + 4, false, true), Ok(FrameId::new(1)));
        assert!(dir.is_accessed(PAGE) && !dir.is_dirty(PAGE));
        dir.access(PAGE + 4, true, true).expect("writable");
        assert!(dir.is_dirty(PAGE));

        // The bits outlive the mapping.
        dir.unmap(PAGE);
        assert!(dir.is_accessed(PAGE) && dir.is_dirty(PAGE));
        dir.set_accessed(PAGE, false);
        assert!(!dir.is_accessed(PAGE));
    }

    #[test]
    fn test_access_fault_codes() {
        let dir = PageDirectory::new();
        let code = dir.access(PAGE, true, true).expect_err("not present");
        assert!(!code.present() && code.write() && code.user());

        dir.map(PAGE, FrameId::new(1), false).expect("unmapped");
        let code = dir.access(PAGE, true, false).expect_err("read-only");
        assert!(code.present() && code.write() && !code.user());
        assert!(!dir.is_dirty(PAGE));
    }
}
