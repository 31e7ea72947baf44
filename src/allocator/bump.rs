use spin::Mutex;

use crate::{
    addr::{Addr, MemoryRegion},
    allocator::{InitialUsage, MetadataSource, PageMarker},
    Align, PAGE_SIZE,
};

/// A bump allocator for whole pages, used before any page frame allocator is up.
///
/// A bump allocator behaves as a stack that can only grow. At each allocation, a new chunk
/// is reserved, starting at the end of the previously allocated chunk. Deallocation is not
/// supported: pages handed out during bootstrap stay reserved, and the allocator reports them
/// as used when the first [`PageFrameAllocator`] is set up.
///
/// [`PageFrameAllocator`]: crate::allocator::PageFrameAllocator
#[derive(Debug)]
pub struct BumpFrameAllocator {
    inner: Mutex<BumpImpl>,
}

#[derive(Debug)]
struct BumpImpl {
    start: usize,
    end: usize,
    ptr: usize,
    allocated: usize,
}

impl BumpFrameAllocator {
    /// Creates a new bump allocator handing out the whole pages within `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    pub fn new(start: Addr, end: Addr) -> Self {
        assert!(start <= end);

        let start = start.align_up(PAGE_SIZE).as_usize();
        let end = end.align_down(PAGE_SIZE).as_usize().max(start);

        Self {
            inner: Mutex::new(BumpImpl {
                start,
                end,
                ptr: start,
                allocated: 0,
            }),
        }
    }

    /// Allocates `count` contiguous pages.
    ///
    /// Returns `None` if not enough pages are left.
    pub fn alloc(&self, count: usize) -> Option<MemoryRegion> {
        let mut bump = self.inner.lock();

        let next = bump.ptr.checked_add(count.checked_mul(PAGE_SIZE)?)?;
        if next > bump.end {
            return None;
        }

        let region = MemoryRegion::from_pages(Addr::new(bump.ptr), count);

        bump.ptr = next;
        bump.allocated += count;

        Some(region)
    }

    /// Returns the region of all the pages allocated so far.
    pub fn used(&self) -> MemoryRegion {
        let bump = self.inner.lock();
        MemoryRegion::new(Addr::new(bump.start), bump.ptr - bump.start)
    }

    /// Returns the number of pages allocated so far.
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Returns the number of pages still available.
    pub fn remaining(&self) -> usize {
        let bump = self.inner.lock();
        (bump.end - bump.ptr) / PAGE_SIZE
    }
}

impl MetadataSource for BumpFrameAllocator {
    fn alloc_raw(&self, size: usize) -> Option<MemoryRegion> {
        self.alloc(size.div_ceil(PAGE_SIZE))
    }
}

impl InitialUsage for BumpFrameAllocator {
    fn mark(&self, pages: &mut PageMarker<'_>) {
        pages.mark_used(self.used());
    }
}
