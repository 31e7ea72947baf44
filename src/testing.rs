//! Fixtures shared by the unit tests.

use std::alloc::{self, Layout};

use crate::{
    addr::{Addr, AddressSpaceKind, MemoryRegion},
    allocator::{DirectMap, InitialUsage, MetadataSource, NoReservations, PageFrameAllocator},
    config::AllocatorConfig,
    PAGE_SIZE,
};

/// A metadata source handing out leaked, page-aligned host memory.
pub(crate) struct HeapMetadata;

impl MetadataSource for HeapMetadata {
    fn alloc_raw(&self, size: usize) -> Option<MemoryRegion> {
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE).ok()?;
        // SAFETY: the layout has a non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(MemoryRegion::new(Addr::new(ptr as usize), size))
    }
}

/// Creates an allocator managing `pages` pages starting at `base`, all of them free.
pub(crate) fn allocator(base: usize, pages: usize, kind: AddressSpaceKind) -> PageFrameAllocator {
    allocator_with(base, pages, kind, AllocatorConfig::new(), &NoReservations)
}

/// Creates an allocator with a custom configuration and initial usage.
pub(crate) fn allocator_with<U>(
    base: usize,
    pages: usize,
    kind: AddressSpaceKind,
    config: AllocatorConfig,
    usage: &U,
) -> PageFrameAllocator
where
    U: InitialUsage + ?Sized,
{
    let region = MemoryRegion::from_pages(Addr::new(base), pages);

    // SAFETY: the descriptor table is backed by leaked host memory
    unsafe {
        PageFrameAllocator::setup(
            region,
            kind,
            config,
            &HeapMetadata,
            usage,
            &DirectMap::IDENTITY,
        )
    }
    .expect("allocator setup failed")
}

/// Leaks `pages` pages of host memory standing in for physical memory starting at address zero,
/// and returns the direct map through which it is accessed.
pub(crate) fn host_memory(pages: usize) -> DirectMap {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("invalid layout");
    // SAFETY: the layout has a non-zero size
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "host allocation failed");

    DirectMap::new(ptr as usize)
}
