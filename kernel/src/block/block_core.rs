use super::BlockError;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Lower-level interface to block device drivers.
///
/// Transfers are blocking and may be issued concurrently from several threads;
/// drivers serialize internally as needed.
pub trait BlockDevice: Send + Sync {
    /// The name of the block device, used in diagnostics.
    fn name(&self) -> &str;

    /// The size of the block device in sectors.
    fn size(&self) -> BlockSector;

    /// Reads sector `sector` into `buf`, which must be exactly `BLOCK_SECTOR_SIZE` bytes.
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf`, which must be exactly `BLOCK_SECTOR_SIZE` bytes, to sector `sector`.
    /// Returns after the device has acknowledged receiving the data.
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// Checks a transfer request against a device of `size` sectors.
pub fn check_request(
    size: BlockSector,
    sector: BlockSector,
    buf_len: usize,
) -> Result<(), BlockError> {
    if buf_len != BLOCK_SECTOR_SIZE {
        return Err(BlockError::BufferInvalid);
    }
    if sector >= size {
        return Err(BlockError::SectorOutOfBounds);
    }
    Ok(())
}
