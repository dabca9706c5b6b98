use super::page::{Page, Residency};
use super::{FrameId, SupplementalPageTable, VmError};
use alloc::{sync::Arc, vec::Vec};
use core::ops::Range;
use kidneyos_vm_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};
use log::warn;

/// A user buffer whose pages are resident and pinned for as long as this
/// guard lives.
///
/// System calls take one of these before touching user memory, so the copy
/// can neither fault nor race with eviction.
pub struct PinnedUserBuffer<'a> {
    spt: &'a SupplementalPageTable,
    start: VirtAddr,
    len: usize,
    pages: Vec<Arc<Page>>,
}

/// Claims and pins every page spanned by `[addr, addr + len)`.
///
/// Fails if any part of the range is outside user space or has no page. On
/// failure, pages pinned so far are unpinned again.
pub fn pin_user_buffer(
    spt: &SupplementalPageTable,
    addr: VirtAddr,
    len: usize,
) -> Result<PinnedUserBuffer<'_>, VmError> {
    let mut buffer = PinnedUserBuffer {
        spt,
        start: addr,
        len,
        pages: Vec::new(),
    };
    if len == 0 {
        return Ok(buffer);
    }

    let end = addr.checked_add(len).ok_or(VmError::BadAddress(addr))?;
    let mmu = spt.mmu();
    if !mmu.is_user_vaddr(addr) || !mmu.is_user_vaddr(end - 1) {
        return Err(VmError::BadAddress(addr));
    }

    let mut upage = addr.page_round_down();
    while upage < end {
        let page = spt.find(upage).ok_or(VmError::NotMapped(upage))?;
        spt.pin(upage)?;
        buffer.pages.push(page.clone());
        // Swapped pages are only marked by `pin`.
        if !matches!(page.residency(), Residency::Resident(_)) {
            spt.claim(&page)?;
        }
        upage = upage + PAGE_FRAME_SIZE;
    }
    Ok(buffer)
}

impl PinnedUserBuffer<'_> {
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the whole buffer out of user memory.
    pub fn copy_out(&self) -> Result<Vec<u8>, VmError> {
        let mut bytes = Vec::with_capacity(self.len);
        for (page, range) in self.spans(self.len) {
            let frame = resident_frame(page)?;
            // SAFETY: The page is pinned, so its frame cannot be evicted.
            let contents = unsafe { self.spt.vm().frames().page(frame) };
            bytes.extend_from_slice(&contents[range]);
            self.spt.mmu().set_accessed(page.upage(), true);
        }
        Ok(bytes)
    }

    /// Copies `data` into the start of the buffer.
    pub fn copy_in(&self, data: &[u8]) -> Result<(), VmError> {
        if data.len() > self.len {
            return Err(VmError::BadAddress(self.start + self.len));
        }
        if let Some((page, _)) = self
            .spans(data.len())
            .find(|(page, _)| !page.writable())
        {
            return Err(VmError::BadAddress(page.upage()));
        }

        let mut data = data;
        for (page, range) in self.spans(data.len()) {
            let frame = resident_frame(page)?;
            let (chunk, rest) = data.split_at(range.len());
            // SAFETY: The page is pinned, so its frame cannot be evicted.
            let contents = unsafe { self.spt.vm().frames().page(frame) };
            contents[range].copy_from_slice(chunk);
            data = rest;

            let mmu = self.spt.mmu();
            mmu.set_accessed(page.upage(), true);
            mmu.set_dirty(page.upage(), true);
        }
        Ok(())
    }

    /// The pages covering the first `len` bytes, each with the byte range
    /// that falls inside it.
    fn spans(&self, len: usize) -> impl Iterator<Item = (&Arc<Page>, Range<usize>)> {
        let start = self.start.as_usize();
        let end = start + len;
        self.pages
            .iter()
            .take_while(move |page| page.upage().as_usize() < end)
            .map(move |page| {
                let base = page.upage().as_usize();
                let lo = start.max(base) - base;
                let hi = end.min(base + PAGE_FRAME_SIZE) - base;
                (page, lo..hi)
            })
    }
}

impl Drop for PinnedUserBuffer<'_> {
    fn drop(&mut self) {
        for page in &self.pages {
            if let Err(err) = self.spt.unpin(page.upage()) {
                warn!("user buffer: could not unpin {}: {err}", page.upage());
            }
        }
    }
}

fn resident_frame(page: &Page) -> Result<FrameId, VmError> {
    match page.residency() {
        Residency::Resident(frame) => Ok(frame),
        _ => Err(VmError::NotMapped(page.upage())),
    }
}
