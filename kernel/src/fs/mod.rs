use crate::block::BlockError;

/// Offset-addressed access to the contents of an open file.
///
/// Only file-backed pages use this, to load their contents on first access and
/// to write dirty contents back on eviction.
pub trait FileBacking: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at byte `offset`, returning the number read.
    /// A short count means the file ended.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, BlockError>;

    /// Writes `buf` starting at byte `offset`, returning the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, BlockError>;
}
