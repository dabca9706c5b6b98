use super::frame_allocator::FrameId;
use super::VmError;
use crate::block::BlockError;
use crate::fs::FileBacking;
use crate::swapping::SwapSlot;
use crate::sync::Mutex;
use alloc::{boxed::Box, sync::Arc};
use core::fmt;
use kidneyos_vm_shared::mem::{KernelPage, VirtAddr, PAGE_FRAME_SIZE};

/// The part of a file that backs one page: `read_bytes` bytes from `offset`,
/// followed by zeros to the end of the page.
#[derive(Clone)]
pub struct FileRegion {
    file: Arc<dyn FileBacking>,
    offset: u64,
    read_bytes: usize,
}

impl FileRegion {
    pub fn new(
        file: Arc<dyn FileBacking>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self, VmError> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_FRAME_SIZE) {
            return Err(VmError::InvalidFileRegion);
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        PAGE_FRAME_SIZE - self.read_bytes
    }

    pub(crate) fn load(&self, page: &mut KernelPage) -> Result<(), VmError> {
        let (data, tail) = page.split_at_mut(self.read_bytes);
        let actual = self.file.read_at(data, self.offset)?;
        if actual != self.read_bytes {
            return Err(VmError::ShortRead {
                expected: self.read_bytes,
                actual,
            });
        }
        tail.fill(0);
        Ok(())
    }

    pub(crate) fn write_back(&self, page: &KernelPage) -> Result<(), VmError> {
        let written = self.file.write_at(&page[..self.read_bytes], self.offset)?;
        if written != self.read_bytes {
            return Err(BlockError::WriteError.into());
        }
        Ok(())
    }
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}

/// Where a page's contents come from the first time it is touched.
#[derive(Debug, Clone)]
pub enum PageKind {
    /// Zero-filled, then swapped.
    Anonymous,
    /// Zero-filled, then swapped. Created by stack growth.
    Stack,
    /// Read from a file; written back to it if dirty and writable.
    FileBacked(FileRegion),
}

impl PageKind {
    pub fn is_file_backed(&self) -> bool {
        matches!(self, PageKind::FileBacked(_))
    }
}

/// Where a page's contents currently live. A page never holds a frame and a
/// swap slot at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    NotLoaded,
    Resident(FrameId),
    Swapped(SwapSlot),
}

/// Fills a page on its first claim. Runs once; a failed run is retried on the
/// next claim.
pub trait PageLoader: Send {
    fn load(&mut self, page: &mut KernelPage) -> Result<(), VmError>;
}

impl<F> PageLoader for F
where
    F: FnMut(&mut KernelPage) -> Result<(), VmError> + Send,
{
    fn load(&mut self, page: &mut KernelPage) -> Result<(), VmError> {
        self(page)
    }
}

pub(crate) struct PageState {
    pub(crate) residency: Residency,
    pub(crate) loader: Option<Box<dyn PageLoader>>,
    /// Set while someone outside the fault path needs the page to stay put.
    pub(crate) pinned: bool,
}

/// One virtual page of an address space.
pub struct Page {
    upage: VirtAddr,
    writable: bool,
    kind: PageKind,
    pub(crate) state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(
        upage: VirtAddr,
        kind: PageKind,
        writable: bool,
        loader: Option<Box<dyn PageLoader>>,
    ) -> Self {
        debug_assert!(upage.is_page_aligned());
        Self {
            upage,
            writable,
            kind,
            state: Mutex::new(PageState {
                residency: Residency::NotLoaded,
                loader,
                pinned: false,
            }),
        }
    }

    pub fn upage(&self) -> VirtAddr {
        self.upage
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn residency(&self) -> Residency {
        self.state.lock().residency
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned
    }

    pub fn has_pending_loader(&self) -> bool {
        self.state.lock().loader.is_some()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("upage", &self.upage)
            .field("writable", &self.writable)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
