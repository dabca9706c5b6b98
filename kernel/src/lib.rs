//! Demand-paged virtual memory: a user frame pool with clock eviction,
//! per-process supplemental page tables, swap space, and page fault
//! resolution.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod fs;
pub mod interrupts;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod threading;

#[cfg(test)]
mod test_utils;
