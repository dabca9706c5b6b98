use super::{OFFSET, PAGE_FRAME_SIZE};
use core::fmt;
use core::ops::{Add, Sub};

/// A virtual address. User addresses lie strictly below [`OFFSET`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_FRAME_SIZE - 1)
    }

    /// Rounds down to the start of the containing page.
    #[inline]
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PAGE_FRAME_SIZE - 1))
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < OFFSET
    }

    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Subtraction clamped at address zero.
    #[inline]
    pub const fn saturating_sub(self, rhs: usize) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for VirtAddr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub for VirtAddr {
    type Output = usize;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let addr = VirtAddr::new(0x0804_8123);
        assert_eq!(addr.page_round_down(), VirtAddr::new(0x0804_8000));
        assert_eq!(addr.page_offset(), 0x123);
        assert!(!addr.is_page_aligned());
        assert!(addr.page_round_down().is_page_aligned());
    }

    #[test]
    fn test_user_range() {
        assert!(VirtAddr::new(OFFSET - 1).is_user());
        assert!(!VirtAddr::new(OFFSET).is_user());
        assert_eq!(VirtAddr::new(16).saturating_sub(32), VirtAddr::new(0));
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
    }
}
