pub mod page_replacement;

use crate::block::{BlockDevice, BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::VmError;
use crate::sync::Mutex;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_vm_shared::bitmap::Bitmap;
use kidneyos_vm_shared::mem::KernelPage;
use kidneyos_vm_shared::sizes::SECTORS_PER_PAGE;
use log::{info, trace};
use zerocopy::FromZeroes;

/// Index of a page-sized slot in swap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }
}

enum Backend {
    /// Slot `n` occupies sectors `n * SECTORS_PER_PAGE..(n + 1) * SECTORS_PER_PAGE`.
    Device(Arc<dyn BlockDevice>),
    /// Page buffers are allocated the first time a slot is written.
    Memory(Box<[Mutex<Option<Box<KernelPage>>>]>),
}

/// Page-sized slots on the swap device, or in kernel memory when the system has
/// no swap device.
///
/// The slot bitmap has its own lock, held only while it is searched or
/// updated. Transfers run without it; callers keep the frame involved pinned.
pub struct SwapSpace {
    used: Mutex<Bitmap>,
    backend: Backend,
    swap_outs: AtomicUsize,
    swap_ins: AtomicUsize,
}

impl SwapSpace {
    /// Uses `device` if present, otherwise `fallback_slots` in-memory slots.
    pub fn new(device: Option<Arc<dyn BlockDevice>>, fallback_slots: usize) -> Self {
        match device {
            Some(device) => Self::with_device(device),
            None => Self::in_memory(fallback_slots),
        }
    }

    pub fn with_device(device: Arc<dyn BlockDevice>) -> Self {
        let slots = (device.size() / SECTORS_PER_PAGE) as usize;
        info!("swap: {} slots on {}", slots, device.name());
        Self::with_backend(slots, Backend::Device(device))
    }

    pub fn in_memory(slots: usize) -> Self {
        info!("swap: no swap device, using {slots} in-memory slots");
        let buffers: Vec<_> = (0..slots).map(|_| Mutex::new(None)).collect();
        Self::with_backend(slots, Backend::Memory(buffers.into_boxed_slice()))
    }

    fn with_backend(slots: usize, backend: Backend) -> Self {
        Self {
            used: Mutex::new(Bitmap::new(slots)),
            backend,
            swap_outs: AtomicUsize::new(0),
            swap_ins: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.used.lock().len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.used.lock().count_ones()
    }

    pub fn is_slot_in_use(&self, slot: SwapSlot) -> bool {
        self.used.lock().test(slot.0)
    }

    pub fn is_memory_backed(&self) -> bool {
        matches!(self.backend, Backend::Memory(_))
    }

    /// Number of pages written to swap so far.
    pub fn swap_outs(&self) -> usize {
        self.swap_outs.load(Ordering::Relaxed)
    }

    /// Number of pages read back from swap so far.
    pub fn swap_ins(&self) -> usize {
        self.swap_ins.load(Ordering::Relaxed)
    }

    pub fn reserve_slot(&self) -> Result<SwapSlot, VmError> {
        self.used
            .lock()
            .scan_and_flip()
            .map(SwapSlot)
            .ok_or(VmError::SwapFull)
    }

    /// Marks `slot` free without reading it back.
    ///
    /// Panics if `slot` is not in use.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut used = self.used.lock();
        assert!(used.test(slot.0), "freeing unused swap slot {}", slot.0);
        // The buffer must be gone before the slot can be reserved again.
        if let Backend::Memory(buffers) = &self.backend {
            buffers[slot.0].lock().take();
        }
        used.set(slot.0, false);
    }

    /// Copies `page` into `slot`, which must have been reserved.
    pub fn write_out(&self, page: &KernelPage, slot: SwapSlot) -> Result<(), VmError> {
        debug_assert!(self.is_slot_in_use(slot));
        match &self.backend {
            Backend::Device(device) => {
                let sectors = Self::first_sector(slot)..;
                for (sector, chunk) in sectors.zip(page.chunks(BLOCK_SECTOR_SIZE)) {
                    device.write(sector, chunk)?;
                }
            }
            Backend::Memory(buffers) => {
                buffers[slot.0]
                    .lock()
                    .get_or_insert_with(<KernelPage as FromZeroes>::new_box_zeroed)
                    .copy_from_slice(page);
            }
        }
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
        trace!("swap: wrote slot {}", slot.0);
        Ok(())
    }

    /// Copies `slot` into `page` and keeps the slot reserved.
    pub fn read(&self, slot: SwapSlot, page: &mut KernelPage) -> Result<(), VmError> {
        debug_assert!(self.is_slot_in_use(slot));
        match &self.backend {
            Backend::Device(device) => {
                let sectors = Self::first_sector(slot)..;
                for (sector, chunk) in sectors.zip(page.chunks_mut(BLOCK_SECTOR_SIZE)) {
                    device.read(sector, chunk)?;
                }
            }
            Backend::Memory(buffers) => match &*buffers[slot.0].lock() {
                Some(buffer) => page.copy_from_slice(&buffer[..]),
                None => page.fill(0),
            },
        }
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
        trace!("swap: read slot {}", slot.0);
        Ok(())
    }

    /// Copies `slot` into `page`, then frees the slot. On failure the slot stays reserved.
    pub fn read_in(&self, slot: SwapSlot, page: &mut KernelPage) -> Result<(), VmError> {
        self.read(slot, page)?;
        self.free_slot(slot);
        Ok(())
    }

    // Slot indices come from a bitmap sized from the device's sector count.
    #[allow(clippy::cast_possible_truncation)]
    fn first_sector(slot: SwapSlot) -> BlockSector {
        slot.0 as BlockSector * SECTORS_PER_PAGE
    }
}
