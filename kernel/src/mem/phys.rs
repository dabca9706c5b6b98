use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use core::ptr::NonNull;
use kidneyos_vm_shared::mem::{KernelPage, PAGE_FRAME_SIZE};

#[repr(C, align(4096))]
struct PageFrame(KernelPage);

const _: () = assert!(core::mem::size_of::<PageFrame>() == PAGE_FRAME_SIZE);

/// The physical frames handed out to user pages, addressed through the kernel's mapping.
pub struct PhysicalMemory {
    start: NonNull<PageFrame>,
    frames: usize,
    owned: bool,
}

// SAFETY: The region is plain memory; access to individual frames is
// coordinated by the frame table.
unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// Allocates a zeroed, page-aligned pool of `frames` frames from the kernel heap.
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "user pool must hold at least one frame");
        let layout = Self::layout(frames);
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(start) = NonNull::new(ptr.cast::<PageFrame>()) else {
            handle_alloc_error(layout)
        };
        Self {
            start,
            frames,
            owned: true,
        }
    }

    /// Wraps a pool the boot code has already carved out of physical memory.
    ///
    /// # Safety
    ///
    /// `start` must be page-aligned and point to `frames` pages that are mapped,
    /// writable, and used by nothing else for as long as the returned value lives.
    pub unsafe fn from_raw(start: NonNull<u8>, frames: usize) -> Self {
        assert!(frames > 0, "user pool must hold at least one frame");
        assert_eq!(
            start.as_ptr() as usize % PAGE_FRAME_SIZE,
            0,
            "user pool is not page-aligned"
        );
        Self {
            start: start.cast::<PageFrame>(),
            frames,
            owned: false,
        }
    }

    fn layout(frames: usize) -> Layout {
        match Layout::array::<PageFrame>(frames) {
            Ok(layout) => layout,
            Err(_) => panic!("user pool of {frames} frames overflows the address space"),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Returns the contents of frame `index`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the frame, which the frame table
    /// guarantees for frames that are pinned and owned by the caller.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page(&self, index: usize) -> &mut KernelPage {
        assert!(index < self.frames, "frame {index} out of range");
        &mut (*self.start.as_ptr().add(index)).0
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: Allocated in `new` with the same layout.
            unsafe { dealloc(self.start.as_ptr().cast::<u8>(), Self::layout(self.frames)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_aligned_and_zeroed() {
        let memory = PhysicalMemory::new(3);
        for i in 0..3 {
            let page = unsafe { memory.page(i) };
            assert_eq!(page.as_ptr() as usize % PAGE_FRAME_SIZE, 0);
            assert!(page.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_frames_do_not_overlap() {
        let memory = PhysicalMemory::new(2);
        unsafe {
            memory.page(0).fill(0x11);
            memory.page(1).fill(0x22);
            assert!(memory.page(0).iter().all(|&b| b == 0x11));
            assert!(memory.page(1).iter().all(|&b| b == 0x22));
        }
    }

    #[test]
    fn test_borrowed_pool_is_left_allocated() {
        let layout = PhysicalMemory::layout(2);
        let ptr = unsafe { alloc_zeroed(layout) };
        let start = NonNull::new(ptr).expect("allocation");
        {
            let memory = unsafe { PhysicalMemory::from_raw(start, 2) };
            assert_eq!(memory.frames(), 2);
            unsafe { memory.page(1) }.fill(0x33);
        }
        // Dropping a borrowed pool does not free it.
        let second = unsafe { core::slice::from_raw_parts(ptr.add(PAGE_FRAME_SIZE), 16) };
        assert!(second.iter().all(|&b| b == 0x33));
        unsafe { dealloc(ptr, layout) };
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn test_unaligned_borrowed_pool() {
        let layout = PhysicalMemory::layout(2);
        let ptr = unsafe { alloc_zeroed(layout) };
        let start = NonNull::new(ptr.wrapping_add(8)).expect("allocation");
        let _memory = unsafe { PhysicalMemory::from_raw(start, 1) };
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_frame() {
        let memory = PhysicalMemory::new(1);
        unsafe {
            memory.page(1);
        }
    }
}
