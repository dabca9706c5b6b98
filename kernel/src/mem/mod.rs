mod config;
mod error;
pub mod frame_allocator;
mod page;
mod phys;
mod spt;
pub mod user;

pub use config::{Placement, VmConfig};
pub use error::{ErrorClass, VmError};
pub use frame_allocator::{FrameId, FrameTable};
pub use page::{FileRegion, Page, PageKind, PageLoader, Residency};
pub use phys::PhysicalMemory;
pub use spt::SupplementalPageTable;

use crate::block::BlockDevice;
use crate::paging::Mmu;
use crate::swapping::SwapSpace;
use alloc::sync::Arc;
use log::{error, info};

/// The frame pool and swap space shared by every address space.
///
/// Built once by the kernel at boot and handed to each process as an
/// [`Arc`]; there is no global instance.
pub struct VirtualMemory {
    config: VmConfig,
    frames: FrameTable,
    swap: Arc<SwapSpace>,
}

impl VirtualMemory {
    /// Allocates the user frame pool from the kernel heap. Swap goes to
    /// `swap_device` when there is one, and to kernel memory otherwise.
    pub fn new(config: VmConfig, swap_device: Option<Arc<dyn BlockDevice>>) -> Arc<Self> {
        let memory = PhysicalMemory::new(config.user_frames);
        Self::with_memory(config, memory, swap_device)
    }

    /// Like [`VirtualMemory::new`], with a frame pool the caller has set aside.
    pub fn with_memory(
        config: VmConfig,
        memory: PhysicalMemory,
        swap_device: Option<Arc<dyn BlockDevice>>,
    ) -> Arc<Self> {
        let swap = Arc::new(SwapSpace::new(swap_device, config.swap_slots));
        let frames = FrameTable::new(memory, swap.clone(), config.placement);
        info!(
            "vm: {} user frames, {} swap slots, {:?} placement",
            frames.capacity(),
            swap.capacity(),
            config.placement
        );
        Arc::new(Self {
            config,
            frames,
            swap,
        })
    }

    /// A new, empty address space translated by `mmu`.
    pub fn address_space(self: &Arc<Self>, mmu: Arc<dyn Mmu>) -> SupplementalPageTable {
        SupplementalPageTable::new(self.clone(), mmu)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Checks that every address space has been torn down.
    ///
    /// Panics if any frame or swap slot is still in use.
    pub fn deinit(&self) {
        let frames = self.frames.frames_allocated();
        let slots = self.swap.slots_in_use();
        if frames != 0 || slots != 0 {
            error!("vm: leaked {frames} frames and {slots} swap slots");
            panic!("virtual memory torn down with {frames} frames and {slots} swap slots in use");
        }
        info!(
            "vm: shut down after {} evictions, {} swap outs, {} swap ins",
            self.frames.evictions(),
            self.swap.swap_outs(),
            self.swap.swap_ins()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{address_space, vm, vm_with, FlakyDisk};
    use kidneyos_vm_shared::mem::VirtAddr;
    use kidneyos_vm_shared::sizes::SECTORS_PER_PAGE;

    #[test]
    fn test_swap_backend_selection() {
        let vm = vm(1);
        assert!(vm.swap().is_memory_backed());
        assert_eq!(vm.swap().capacity(), VmConfig::default().swap_slots);

        let disk = Arc::new(FlakyDisk::new(16 * SECTORS_PER_PAGE));
        let vm = vm_with(VmConfig::default().with_user_frames(1), Some(disk));
        assert!(!vm.swap().is_memory_backed());
        assert_eq!(vm.swap().capacity(), 16);
    }

    #[test]
    #[should_panic(expected = "torn down with 1 frames")]
    fn test_deinit_detects_leaked_frame() {
        let vm = vm(2);
        let _frame = vm.frames().allocate().expect("free frame");
        vm.deinit();
    }

    #[test]
    fn test_deinit_after_teardown() {
        let vm = vm(1);
        let (spt, _dir) = address_space(&vm);
        for n in 0..3 {
            let page = spt
                .declare(PageKind::Stack, VirtAddr::new(0x4000_0000 + n * 0x1000), true)
                .expect("declare");
            spt.claim(&page).expect("claim");
        }
        assert_eq!(vm.frames().evictions(), 2);
        drop(spt);
        vm.deinit();
    }
}
