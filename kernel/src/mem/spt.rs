use super::page::{FileRegion, Page, PageKind, PageLoader, PageState, Residency};
use super::{VirtualMemory, VmError};
use crate::fs::FileBacking;
use crate::paging::Mmu;
use crate::sync::Mutex;
use alloc::{
    boxed::Box,
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
};
use core::mem;
use kidneyos_vm_shared::mem::VirtAddr;
use log::trace;
use scopeguard::ScopeGuard;

/// The pages of one address space, keyed by page address.
///
/// Every page of user memory that may be touched has a descriptor here, even
/// while its contents live in swap or have never been loaded.
pub struct SupplementalPageTable {
    vm: Arc<VirtualMemory>,
    mmu: Arc<dyn Mmu>,
    pages: Mutex<BTreeMap<VirtAddr, Arc<Page>>>,
}

impl SupplementalPageTable {
    pub fn new(vm: Arc<VirtualMemory>, mmu: Arc<dyn Mmu>) -> Self {
        Self {
            vm,
            mmu,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn vm(&self) -> &Arc<VirtualMemory> {
        &self.vm
    }

    pub fn mmu(&self) -> &Arc<dyn Mmu> {
        &self.mmu
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Adds a not-yet-loaded page containing `addr`.
    ///
    /// Fails without touching the table if the page already has a descriptor.
    pub fn declare(
        &self,
        kind: PageKind,
        addr: VirtAddr,
        writable: bool,
    ) -> Result<Arc<Page>, VmError> {
        self.insert(kind, addr, writable, None)
    }

    /// Like [`SupplementalPageTable::declare`], but the page's first claim
    /// fills it with `loader` instead of by kind.
    pub fn declare_lazy(
        &self,
        kind: PageKind,
        addr: VirtAddr,
        writable: bool,
        loader: impl PageLoader + 'static,
    ) -> Result<Arc<Page>, VmError> {
        self.insert(kind, addr, writable, Some(Box::new(loader)))
    }

    /// Declares a page read from `read_bytes` bytes of `file` at `offset`,
    /// followed by `zero_bytes` zeros.
    pub fn declare_file(
        &self,
        addr: VirtAddr,
        writable: bool,
        file: Arc<dyn FileBacking>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Arc<Page>, VmError> {
        let region = FileRegion::new(file, offset, read_bytes, zero_bytes)?;
        self.insert(PageKind::FileBacked(region), addr, writable, None)
    }

    fn insert(
        &self,
        kind: PageKind,
        addr: VirtAddr,
        writable: bool,
        loader: Option<Box<dyn PageLoader>>,
    ) -> Result<Arc<Page>, VmError> {
        let upage = addr.page_round_down();
        if !self.mmu.is_user_vaddr(upage) {
            return Err(VmError::BadAddress(addr));
        }
        match self.pages.lock().entry(upage) {
            Entry::Occupied(_) => Err(VmError::AlreadyMapped(upage)),
            Entry::Vacant(entry) => {
                let page = Arc::new(Page::new(upage, kind, writable, loader));
                entry.insert(page.clone());
                Ok(page)
            }
        }
    }

    /// Looks up the page containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<Arc<Page>> {
        self.pages.lock().get(&addr.page_round_down()).cloned()
    }

    /// Drops the page containing `addr`, giving back its frame or swap slot.
    pub fn remove(&self, addr: VirtAddr) -> Result<(), VmError> {
        let upage = addr.page_round_down();
        let page = self
            .pages
            .lock()
            .remove(&upage)
            .ok_or(VmError::NotMapped(upage))?;
        self.release(&page);
        Ok(())
    }

    /// Removes every page.
    pub fn destroy(&self) {
        let pages = mem::take(&mut *self.pages.lock());
        for page in pages.into_values() {
            self.release(&page);
        }
    }

    fn release(&self, page: &Page) {
        let mut state = page.state.lock();
        match mem::replace(&mut state.residency, Residency::NotLoaded) {
            Residency::Resident(frame) => {
                self.mmu.unmap(page.upage());
                self.vm.frames().free(frame);
            }
            Residency::Swapped(slot) => self.vm.swap().free_slot(slot),
            Residency::NotLoaded => {}
        }
        state.loader = None;
        state.pinned = false;
    }

    /// Makes `page` resident and mapped. Does nothing if it already is.
    ///
    /// On failure nothing changes: no frame is kept, a swap slot or pending
    /// loader stays where it was, and a later claim may succeed.
    pub fn claim(&self, page: &Arc<Page>) -> Result<(), VmError> {
        let mut state = page.state.lock();
        self.claim_locked(page, &mut state)
    }

    fn claim_locked(&self, page: &Arc<Page>, state: &mut PageState) -> Result<(), VmError> {
        if let Residency::Resident(_) = state.residency {
            return Ok(());
        }

        let frames = self.vm.frames();
        let frame = scopeguard::guard(frames.allocate()?, |frame| frames.free(frame));
        // SAFETY: The frame is pinned and not yet bound or mapped.
        let contents = unsafe { frames.page(*frame) };

        match (&mut state.loader, page.kind(), state.residency) {
            (Some(loader), _, _) => loader.load(contents)?,
            (None, _, Residency::Swapped(slot)) => self.vm.swap().read(slot, contents)?,
            (None, PageKind::FileBacked(region), _) => region.load(contents)?,
            // Fresh frames are already zeroed.
            (None, PageKind::Anonymous | PageKind::Stack, _) => {}
        }

        self.mmu.map(page.upage(), *frame, page.writable())?;
        if page.kind().is_file_backed() {
            self.mmu.set_dirty(page.upage(), false);
        }

        // Nothing below can fail.
        let frame = ScopeGuard::into_inner(frame);
        state.loader = None;
        if let Residency::Swapped(slot) = state.residency {
            self.vm.swap().free_slot(slot);
        }
        state.residency = Residency::Resident(frame);
        frames.bind(frame, page, self.mmu.clone());
        if !state.pinned {
            frames.unpin(frame);
        }
        trace!("spt: {} is resident in frame {}", page.upage(), frame.index());
        Ok(())
    }

    /// Keeps the page containing `addr` from being evicted.
    ///
    /// A page that has never been loaded is claimed first. A swapped page is
    /// only marked; it stays pinned from its next claim on.
    pub fn pin(&self, addr: VirtAddr) -> Result<(), VmError> {
        let page = self.lookup(addr)?;
        let mut state = page.state.lock();
        let was_pinned = mem::replace(&mut state.pinned, true);
        match state.residency {
            Residency::Resident(frame) => self.vm.frames().pin(frame),
            Residency::NotLoaded => {
                if let Err(err) = self.claim_locked(&page, &mut state) {
                    state.pinned = was_pinned;
                    return Err(err);
                }
            }
            Residency::Swapped(_) => {}
        }
        Ok(())
    }

    pub fn unpin(&self, addr: VirtAddr) -> Result<(), VmError> {
        let page = self.lookup(addr)?;
        let mut state = page.state.lock();
        state.pinned = false;
        if let Residency::Resident(frame) = state.residency {
            self.vm.frames().unpin(frame);
        }
        Ok(())
    }

    fn lookup(&self, addr: VirtAddr) -> Result<Arc<Page>, VmError> {
        self.find(addr)
            .ok_or(VmError::NotMapped(addr.page_round_down()))
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.destroy();
    }
}
