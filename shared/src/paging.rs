// https://wiki.osdev.org/Paging

use arbitrary_int::u20;
use bitbybit::bitfield;

/// A 32-bit x86 page table entry.
///
/// The address field holds a frame number, which for the user pool is an
/// index into the frame table rather than a raw physical address.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub read_write: bool,
    #[bit(2, rw)]
    pub user_supervisor: bool,
    #[bit(3, rw)]
    pub write_through: bool,
    #[bit(4, rw)]
    pub cache_disable: bool,
    #[bit(5, rw)]
    pub accessed: bool,
    #[bit(6, rw)]
    pub dirty: bool,
    #[bit(7, rw)]
    pub page_attribute_table: bool,
    #[bit(8, rw)]
    pub global: bool,
    #[bits(12..=31, rw)]
    pub page_frame_address: u20,
}

impl PageTableEntry {
    /// Builds a present user entry pointing at frame number `frame`.
    ///
    /// Returns [`None`] if `frame` does not fit in the 20-bit address field.
    pub fn user_mapping(frame: usize, writable: bool) -> Option<Self> {
        let frame = u32::try_from(frame).ok()?;
        if frame >= 1 << 20 {
            return None;
        }
        let frame = u20::new(frame);
        Some(
            Self::default()
                .with_present(true)
                .with_read_write(writable)
                .with_user_supervisor(true)
                .with_page_frame_address(frame),
        )
    }

    pub fn frame_number(self) -> usize {
        self.page_frame_address().value() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_mapping() {
        let entry = PageTableEntry::user_mapping(0x1234, true).expect("frame fits");
        assert!(entry.present());
        assert!(entry.read_write());
        assert!(entry.user_supervisor());
        assert!(!entry.accessed());
        assert!(!entry.dirty());
        assert_eq!(entry.frame_number(), 0x1234);
        assert_eq!(entry.raw_value() & 0xfff, 0b111);
    }

    #[test]
    fn test_frame_number_overflow() {
        assert!(PageTableEntry::user_mapping(1 << 20, false).is_none());
        assert!(PageTableEntry::user_mapping((1 << 20) - 1, false).is_some());
    }

    #[test]
    fn test_clearing_present_keeps_status_bits() {
        let entry = PageTableEntry::user_mapping(7, true)
            .expect("frame fits")
            .with_accessed(true)
            .with_dirty(true)
            .with_present(false);
        assert!(!entry.present());
        assert!(entry.accessed());
        assert!(entry.dirty());
    }
}
