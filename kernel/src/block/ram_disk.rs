use super::block_core::check_request;
use super::{BlockDevice, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::{string::String, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

/// A block device backed by kernel memory.
pub struct RamDisk {
    name: String,
    sectors: BlockSector,
    data: Mutex<Vec<u8>>,
    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl RamDisk {
    pub fn new(name: &str, sectors: BlockSector) -> Self {
        Self {
            name: String::from(name),
            sectors,
            data: Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> BlockSector {
        self.sectors
    }

    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        check_request(self.sectors, sector, buf.len())?;
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        buf.copy_from_slice(&self.data.lock()[start..start + BLOCK_SECTOR_SIZE]);
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        check_request(self.sectors, sector, buf.len())?;
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        self.data.lock()[start..start + BLOCK_SECTOR_SIZE].copy_from_slice(buf);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_round_trip() {
        let disk = RamDisk::new("hdb1", 4);
        let data = [0xabu8; BLOCK_SECTOR_SIZE];
        disk.write(3, &data).expect("write in range");

        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        disk.read(3, &mut buf).expect("read in range");
        assert_eq!(buf, data);

        disk.read(2, &mut buf).expect("read in range");
        assert_eq!(buf, [0u8; BLOCK_SECTOR_SIZE]);
        assert_eq!(disk.read_count(), 2);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let disk = RamDisk::new("hdb1", 4);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert_eq!(disk.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(
            disk.write(0, &buf[..BLOCK_SECTOR_SIZE - 1]),
            Err(BlockError::BufferInvalid)
        );
        assert_eq!(disk.write_count(), 0);
    }
}
