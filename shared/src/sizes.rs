pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
/// Number of disk sectors backing one page-sized swap slot.
pub const SECTORS_PER_PAGE: u32 = 8;
/// Slots in the in-memory swap fallback when no swap device is present.
pub const DEFAULT_SWAP_SLOTS: usize = 1024;
