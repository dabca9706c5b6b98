mod addr;

pub use addr::VirtAddr;

use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

/// The contents of one page frame as seen through the kernel's mapping.
pub type KernelPage = [u8; PAGE_FRAME_SIZE];

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Upper bound on the size of a user stack, measured down from the top of user memory.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// How far below the stack pointer a fault may land and still count as stack growth.
/// `pusha` writes 32 bytes below `esp` before `esp` is updated.
pub const STACK_HEURISTIC: usize = 32;
