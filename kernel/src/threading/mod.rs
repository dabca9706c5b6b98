pub mod process;
pub mod thread_control_block;

pub use process::{Pid, Process};
pub use thread_control_block::{ThreadControlBlock, Tid};
