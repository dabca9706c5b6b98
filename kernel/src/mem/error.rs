use crate::block::BlockError;
use kidneyos_vm_shared::mem::VirtAddr;
use thiserror::Error;

/// Failures reported by the paging subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("page {0} already has a descriptor")]
    AlreadyMapped(VirtAddr),
    #[error("no descriptor for page {0}")]
    NotMapped(VirtAddr),
    #[error("{0} is not a user address")]
    BadAddress(VirtAddr),
    #[error("file region does not cover exactly one page")]
    InvalidFileRegion,
    #[error("every user frame is pinned")]
    AllFramesPinned,
    #[error("swap space is full")]
    SwapFull,
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("could not install a mapping for {0}")]
    MapFailed(VirtAddr),
    #[error("lazy loader failed")]
    LoaderFailed,
    #[error("block device: {0}")]
    Io(#[from] BlockError),
}

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No frame or swap slot could be found. Fatal to a faulting process only.
    ResourceExhausted,
    /// A swap or file transfer failed. Fatal to a faulting process only.
    IoFailure,
    /// The caller named a page it has no right to. Fatal to the process.
    InvalidAccess,
    /// The kernel itself is in an inconsistent state. Halts the system.
    KernelInvariantViolation,
}

impl VmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VmError::SwapFull => ErrorClass::ResourceExhausted,
            VmError::AllFramesPinned | VmError::MapFailed(_) => {
                ErrorClass::KernelInvariantViolation
            }
            VmError::ShortRead { .. } | VmError::LoaderFailed | VmError::Io(_) => {
                ErrorClass::IoFailure
            }
            VmError::AlreadyMapped(_)
            | VmError::NotMapped(_)
            | VmError::BadAddress(_)
            | VmError::InvalidFileRegion => ErrorClass::InvalidAccess,
        }
    }
}
