pub mod placement_algorithms;

use self::placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm};
use super::config::Placement;
use super::page::{Page, PageKind, PageState, Residency};
use super::phys::PhysicalMemory;
use super::VmError;
use crate::paging::Mmu;
use crate::swapping::page_replacement::{Clock, FrameScan, PageReplacementPolicy};
use crate::swapping::{SwapSlot, SwapSpace};
use crate::sync::Mutex;
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use bitbybit::bitfield;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_vm_shared::mem::{KernelPage, VirtAddr};
use log::{debug, warn};
use scopeguard::ScopeGuard;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
}

/// Index of a frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// The page a resident frame holds, and the address space it is mapped in.
struct Binding {
    page: Weak<Page>,
    upage: VirtAddr,
    mmu: Arc<dyn Mmu>,
}

struct Frames {
    core_map: Box<[CoreMapEntry]>,
    bindings: Box<[Option<Binding>]>,
}

impl FrameScan for Frames {
    fn len(&self) -> usize {
        self.core_map.len()
    }

    fn is_candidate(&self, index: usize) -> bool {
        let entry = self.core_map[index];
        entry.allocated()
            && !entry.pinned()
            && self.bindings[index]
                .as_ref()
                .is_some_and(|binding| binding.page.strong_count() > 0)
    }

    fn test_and_clear_accessed(&self, index: usize) -> bool {
        let Some(binding) = &self.bindings[index] else {
            return false;
        };
        let accessed = binding.mmu.is_accessed(binding.upage);
        if accessed {
            binding.mmu.set_accessed(binding.upage, false);
        }
        accessed
    }
}

struct FrameTableInner {
    frames: Frames,
    placement: Box<dyn PlacementAlgorithm>,
    clock: Clock,
    frames_allocated: usize,
}

impl FrameTableInner {
    /// Claims a free frame, handing it out pinned and unbound.
    fn take_free_frame(&mut self) -> Option<FrameId> {
        let index = self.placement.place(&self.frames.core_map)?;
        debug_assert!(self.frames.bindings[index].is_none());
        self.frames.core_map[index] = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_pinned(true);
        self.frames_allocated += 1;
        Some(FrameId(index))
    }
}

/// The user frame pool. Frames come from free space when possible and from
/// evicting resident pages otherwise.
///
/// Lock order: a page's state lock may be held while taking the table lock,
/// never the reverse. Eviction only ever try-locks a victim's state.
pub struct FrameTable {
    memory: PhysicalMemory,
    inner: Mutex<FrameTableInner>,
    swap: Arc<SwapSpace>,
    evictions: AtomicUsize,
}

impl FrameTable {
    pub fn new(memory: PhysicalMemory, swap: Arc<SwapSpace>, placement: Placement) -> Self {
        let frames = memory.frames();
        let placement: Box<dyn PlacementAlgorithm> = match placement {
            Placement::NextFit => Box::new(NextFit::default()),
            Placement::FirstFit => Box::new(FirstFit),
        };
        Self {
            memory,
            inner: Mutex::new(FrameTableInner {
                frames: Frames {
                    core_map: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                    bindings: (0..frames).map(|_| None).collect(),
                },
                placement,
                clock: Clock::default(),
                frames_allocated: 0,
            }),
            swap,
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.frames()
    }

    pub fn frames_allocated(&self) -> usize {
        self.inner.lock().frames_allocated
    }

    /// Number of pages evicted so far.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn is_allocated(&self, id: FrameId) -> bool {
        self.inner.lock().frames.core_map[id.0].allocated()
    }

    pub fn is_pinned(&self, id: FrameId) -> bool {
        self.inner.lock().frames.core_map[id.0].pinned()
    }

    /// Frames currently holding a resident page.
    pub fn bound_frames(&self) -> Vec<FrameId> {
        let inner = self.inner.lock();
        (0..inner.frames.len())
            .filter(|&i| inner.frames.bindings[i].is_some())
            .map(FrameId)
            .collect()
    }

    /// Obtains a zeroed frame, evicting a resident page if the pool is full.
    ///
    /// The frame is returned pinned and bound to nothing. The caller owns it
    /// until it calls [`FrameTable::bind`] or [`FrameTable::free`].
    pub fn allocate(&self) -> Result<FrameId, VmError> {
        let free = self.inner.lock().take_free_frame();
        let id = match free {
            Some(id) => id,
            None => self.evict()?,
        };
        // SAFETY: The frame is pinned and unbound, so nothing else refers to it.
        unsafe { self.page(id) }.fill(0);
        Ok(id)
    }

    /// Returns a frame to the pool. The caller must already have detached it
    /// from its page and removed any mapping to it.
    pub fn free(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        assert!(
            inner.frames.core_map[id.0].allocated(),
            "freeing unallocated frame {}",
            id.0
        );
        inner.frames.core_map[id.0] = CoreMapEntry::DEFAULT;
        inner.frames.bindings[id.0] = None;
        inner.frames_allocated -= 1;
    }

    /// Records that `id` now holds `page`, mapped through `mmu`.
    pub(crate) fn bind(&self, id: FrameId, page: &Arc<Page>, mmu: Arc<dyn Mmu>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.frames.core_map[id.0].allocated());
        inner.frames.bindings[id.0] = Some(Binding {
            page: Arc::downgrade(page),
            upage: page.upage(),
            mmu,
        });
    }

    pub fn pin(&self, id: FrameId) {
        self.set_pinned(id, true);
    }

    pub fn unpin(&self, id: FrameId) {
        self.set_pinned(id, false);
    }

    fn set_pinned(&self, id: FrameId, pinned: bool) {
        let mut inner = self.inner.lock();
        let entry = inner.frames.core_map[id.0];
        debug_assert!(entry.allocated());
        inner.frames.core_map[id.0] = entry.with_pinned(pinned);
    }

    /// The contents of frame `id`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame and have it pinned, or otherwise know
    /// that no eviction or load can touch it for the lifetime of the result.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page(&self, id: FrameId) -> &mut KernelPage {
        self.memory.page(id.0)
    }

    /// Picks a victim with the clock and writes its page out. The freed frame
    /// is handed back pinned and unbound, like a fresh allocation.
    fn evict(&self) -> Result<FrameId, VmError> {
        loop {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            // Another thread may have freed a frame since the caller looked.
            if let Some(id) = inner.take_free_frame() {
                return Ok(id);
            }

            let Some(index) = inner.clock.evict_page(&inner.frames) else {
                warn!("frame table: every user frame is pinned");
                return Err(VmError::AllFramesPinned);
            };
            let Some(binding) = &inner.frames.bindings[index] else {
                continue;
            };
            let Some(page) = binding.page.upgrade() else {
                continue;
            };
            let mmu = binding.mmu.clone();

            // Whoever holds the page's lock is pinning, claiming, or releasing
            // it. Leave it alone and let the clock move on.
            let Some(mut state) = page.state.try_lock() else {
                continue;
            };
            if state.residency != Residency::Resident(FrameId(index)) {
                warn!(
                    "frame table: frame {} is bound to {} which is not resident there",
                    index,
                    page.upage()
                );
                continue;
            }

            inner.frames.core_map[index] = inner.frames.core_map[index].with_pinned(true);
            drop(guard);

            let victim = scopeguard::guard(FrameId(index), |id| self.unpin(id));
            self.write_out(*victim, &page, &mut state, &*mmu)?;
            let id = ScopeGuard::into_inner(victim);

            // The frame stays allocated and pinned for its new owner.
            self.inner.lock().frames.bindings[id.0] = None;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }
    }

    /// Unmaps the page held by `id` and saves its contents where the next
    /// claim will find them. On failure the mapping is put back.
    fn write_out(
        &self,
        id: FrameId,
        page: &Page,
        state: &mut PageState,
        mmu: &dyn Mmu,
    ) -> Result<(), VmError> {
        let upage = page.upage();
        mmu.unmap(upage);
        let dirty = mmu.is_dirty(upage);

        // SAFETY: The frame is pinned and no longer mapped.
        let contents = unsafe { self.page(id) };
        let result = match page.kind() {
            PageKind::Anonymous | PageKind::Stack => {
                self.swap_out(contents).map(Residency::Swapped)
            }
            PageKind::FileBacked(region) if dirty && page.writable() => {
                region.write_back(contents).map(|()| Residency::NotLoaded)
            }
            PageKind::FileBacked(_) => Ok(Residency::NotLoaded),
        };

        match result {
            Ok(residency) => {
                debug!(
                    "frame table: evicted {} ({:?}) from frame {} to {:?}",
                    upage,
                    page.kind(),
                    id.0,
                    residency
                );
                state.residency = residency;
                Ok(())
            }
            Err(err) => {
                warn!("frame table: failed to evict {upage}: {err}");
                if mmu.map(upage, id, page.writable()).is_err() {
                    panic!("could not restore mapping for {upage} after failed eviction");
                }
                mmu.set_dirty(upage, dirty);
                Err(err)
            }
        }
    }

    fn swap_out(&self, contents: &KernelPage) -> Result<SwapSlot, VmError> {
        let slot = self.swap.reserve_slot()?;
        if let Err(err) = self.swap.write_out(contents, slot) {
            self.swap.free_slot(slot);
            return Err(err);
        }
        Ok(slot)
    }
}
