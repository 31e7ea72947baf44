#![allow(dead_code)]

use std::alloc::{self, Layout};

use pfalloc::{
    addr::{Addr, AddressSpaceKind, MemoryRegion},
    allocator::{DirectMap, InitialUsage, NoReservations, PageFrameAllocator},
    config::AllocatorConfig,
    page::Page,
    PAGE_SIZE,
};

/// Leaks a page-aligned chunk of `size` bytes of host memory and returns its address.
pub fn chunk(size: usize) -> usize {
    let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr as usize
}

/// Metadata source backed by leaked host memory.
pub fn heap_metadata(size: usize) -> Option<MemoryRegion> {
    Some(MemoryRegion::new(Addr::new(chunk(size)), size))
}

/// Creates an allocator for `pages` pages at `base`, with its descriptor table in host memory.
pub fn create_allocator(
    base: usize,
    pages: usize,
    kind: AddressSpaceKind,
    config: AllocatorConfig,
) -> PageFrameAllocator {
    create_allocator_with(base, pages, kind, config, &NoReservations)
}

pub fn create_allocator_with<U: InitialUsage>(
    base: usize,
    pages: usize,
    kind: AddressSpaceKind,
    config: AllocatorConfig,
    usage: &U,
) -> PageFrameAllocator {
    unsafe {
        PageFrameAllocator::setup(
            MemoryRegion::from_pages(Addr::new(base), pages),
            kind,
            config,
            &heap_metadata,
            usage,
            &DirectMap::IDENTITY,
        )
    }
    .unwrap()
}

/// Returns the pages of the allocation starting at `first`, in compound order.
pub fn compound_pages(allocator: &PageFrameAllocator, first: Page) -> Vec<Page> {
    let mut pages = vec![first];
    let mut page = allocator.next_compound_page(first).unwrap();
    while page != first {
        pages.push(page);
        page = allocator.next_compound_page(page).unwrap();
    }
    pages
}

/// A small xorshift generator, enough to shuffle operations deterministically.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}
