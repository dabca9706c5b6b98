use kidneyos_vm_shared::mem::{VirtAddr, MAX_STACK_SIZE, OFFSET, STACK_HEURISTIC};
use kidneyos_vm_shared::sizes::DEFAULT_SWAP_SLOTS;

/// How free frames are searched for before falling back to eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Placement {
    #[default]
    NextFit,
    FirstFit,
}

/// Tunables for the virtual memory subsystem.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub user_frames: usize,
    /// Capacity of the in-memory swap fallback, used when no swap device exists.
    pub swap_slots: usize,
    /// Largest user stack, measured down from `user_top`.
    pub max_stack_size: usize,
    /// How far below the stack pointer a fault still counts as stack growth.
    pub stack_heuristic: usize,
    /// One past the highest user address; the initial stack pointer.
    pub user_top: VirtAddr,
    pub placement: Placement,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            swap_slots: DEFAULT_SWAP_SLOTS,
            max_stack_size: MAX_STACK_SIZE,
            stack_heuristic: STACK_HEURISTIC,
            user_top: VirtAddr::new(OFFSET),
            placement: Placement::NextFit,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(mut self, frames: usize) -> Self {
        self.user_frames = frames;
        self
    }

    pub fn with_swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }

    pub fn with_max_stack_size(mut self, size: usize) -> Self {
        self.max_stack_size = size;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}
