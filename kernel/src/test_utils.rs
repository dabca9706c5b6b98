use crate::block::{BlockDevice, BlockError, BlockSector, RamDisk};
use crate::fs::FileBacking;
use crate::mem::{SupplementalPageTable, VirtualMemory, VmConfig};
use crate::paging::PageDirectory;
use crate::sync::Mutex;
use crate::threading::{Process, ThreadControlBlock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A file held in memory that counts writes and can be made to fail.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl FileBacking for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, BlockError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, BlockError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(buf.len())
    }
}

/// A [`RamDisk`] whose reads and writes can be made to fail.
pub struct FlakyDisk {
    disk: RamDisk,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            disk: RamDisk::new("swap", sectors),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl BlockDevice for FlakyDisk {
    fn name(&self) -> &str {
        self.disk.name()
    }

    fn size(&self) -> BlockSector {
        self.disk.size()
    }

    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        self.disk.read(sector, buf)
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        self.disk.write(sector, buf)
    }
}

/// A VM with `frames` user frames and in-memory swap.
pub fn vm(frames: usize) -> Arc<VirtualMemory> {
    vm_with(VmConfig::default().with_user_frames(frames), None)
}

pub fn vm_with(config: VmConfig, swap: Option<Arc<dyn BlockDevice>>) -> Arc<VirtualMemory> {
    VirtualMemory::new(config, swap)
}

/// An empty address space, and the page directory it maps pages in.
pub fn address_space(vm: &Arc<VirtualMemory>) -> (SupplementalPageTable, Arc<PageDirectory>) {
    let dir = Arc::new(PageDirectory::new());
    (vm.address_space(dir.clone()), dir)
}

/// The only thread of a fresh process.
pub fn thread(vm: &Arc<VirtualMemory>) -> (ThreadControlBlock, Arc<PageDirectory>) {
    let (spt, dir) = address_space(vm);
    let process = Arc::new(Process::new(1, "test", spt));
    (ThreadControlBlock::new(1, process), dir)
}
