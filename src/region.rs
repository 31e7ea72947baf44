//! The kernel-facing page frame manager.

use core::cell::Cell;

use log::{debug, trace};

use crate::{
    addr::{Addr, AddressSpaceKind, MemoryRegion},
    allocator::{
        AllocOptions, BumpFrameAllocator, InitialUsage, MemoryOps, MetadataSource,
        PageFrameAllocator, PageMarker, SetupError,
    },
    config::AllocatorConfig,
    page::Page,
    Align, PAGE_SIZE,
};

/// Owner of the physical page frame allocator.
///
/// This is what the rest of the kernel allocates physical pages from. It also sets up the
/// allocators of virtual address spaces, whose descriptor tables live in physical pages.
#[derive(Debug)]
pub struct RegionManager {
    default: PageFrameAllocator,
}

/// Initial usage of physical memory at boot: everything handed out by the bootstrap allocator
/// (including the descriptor table itself), plus the reserved regions.
#[derive(Debug)]
struct BootUsage<'a> {
    bootstrap: &'a BumpFrameAllocator,
    reserved: &'a [MemoryRegion],
}

impl InitialUsage for BootUsage<'_> {
    fn mark(&self, pages: &mut PageMarker<'_>) {
        pages.mark_used(self.bootstrap.used());

        for region in self.reserved {
            pages.mark_used(*region);
        }
    }
}

impl RegionManager {
    /// Wraps an already set up physical allocator.
    pub fn new(allocator: PageFrameAllocator) -> Self {
        debug_assert_eq!(allocator.kind(), AddressSpaceKind::Physical);
        Self { default: allocator }
    }

    /// Sets up the physical page frame allocator for `installed_memory` bytes of RAM starting at
    /// address zero.
    ///
    /// The descriptor table is taken from `bootstrap`. All the pages handed out by `bootstrap`
    /// so far, and those in `reserved` (e.g. the kernel image), are marked as used.
    ///
    /// # Safety
    ///
    /// Physical memory must be accessible through `ops`, and the memory of `bootstrap` must not
    /// be in use by anything else.
    pub unsafe fn setup<O>(
        installed_memory: usize,
        bootstrap: &BumpFrameAllocator,
        reserved: &[MemoryRegion],
        ops: &O,
        config: AllocatorConfig,
    ) -> Result<Self, SetupError>
    where
        O: MemoryOps + ?Sized,
    {
        let region = MemoryRegion::new(Addr::new(0), installed_memory.align_down(PAGE_SIZE));
        let usage = BootUsage {
            bootstrap,
            reserved,
        };

        // SAFETY: assuming the caller has upheld the safety contract
        let allocator = unsafe {
            PageFrameAllocator::setup(
                region,
                AddressSpaceKind::Physical,
                config,
                bootstrap,
                &usage,
                ops,
            )
        }?;

        Ok(Self::new(allocator))
    }

    /// Sets up an allocator for the virtual address range `region`.
    ///
    /// Its descriptor table is allocated from contiguous physical pages, which `ops` must be
    /// able to access. All of its allocations are contiguous. If setup fails, the pages taken
    /// for the table are released.
    ///
    /// # Safety
    ///
    /// Physical memory must be accessible through `ops`.
    pub unsafe fn setup_address_space<U, O>(
        &self,
        region: MemoryRegion,
        usage: &U,
        ops: &O,
        config: AllocatorConfig,
    ) -> Result<PageFrameAllocator, SetupError>
    where
        U: InitialUsage + ?Sized,
        O: MemoryOps + ?Sized,
    {
        trace!("setting up address space {}", region);

        let table = Cell::new(None);
        let metadata = |size: usize| {
            let pages = self.default.alloc_raw(size);
            table.set(pages);
            pages
        };

        // SAFETY: pages allocated from the physical allocator are never handed out twice, and
        // the caller guarantees that `ops` can reach them.
        let res = unsafe {
            PageFrameAllocator::setup(
                region,
                AddressSpaceKind::Virtual,
                config,
                &metadata,
                usage,
                ops,
            )
        };

        // Give back the descriptor table pages if setup failed after taking them
        if let (Err(err), Some(pages)) = (&res, table.get()) {
            debug!("releasing {} after failed setup: {}", pages, err);
            self.free_addr(pages.start());
        }

        res
    }

    /// Allocates a physical page. Running out of memory is fatal.
    pub fn allocate_page(&self, options: AllocOptions<'_>) -> Page {
        self.default.allocate_page(options)
    }

    /// Allocates `count` physical pages. Running out of memory is fatal.
    pub fn allocate_pages(&self, count: usize, options: AllocOptions<'_>) -> Page {
        self.default.allocate_pages(count, options)
    }

    /// Allocates a physical page and returns its address.
    pub fn allocate_page_addr(&self, options: AllocOptions<'_>) -> Addr {
        self.default.address_of(self.allocate_page(options))
    }

    /// Allocates `count` physical pages and returns the address of the first one.
    pub fn allocate_pages_addr(&self, count: usize, options: AllocOptions<'_>) -> Addr {
        self.default.address_of(self.allocate_pages(count, options))
    }

    /// Allocates enough physical pages to hold `size` bytes.
    pub fn allocate_region(&self, size: usize, options: AllocOptions<'_>) -> Page {
        self.allocate_pages(size.div_ceil(PAGE_SIZE), options)
    }

    /// Releases the allocation starting at `page`.
    pub fn free(&self, page: Page) {
        self.default.free(page)
    }

    /// Releases the allocation starting at the page containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside of physical memory.
    pub fn free_addr(&self, addr: Addr) {
        match self.get_phys_page(addr) {
            Some(page) => self.free(page),
            None => panic!("freeing {} outside of physical memory", addr),
        }
    }

    /// Returns the physical page containing `addr`.
    pub fn get_phys_page(&self, addr: Addr) -> Option<Page> {
        self.default.get_page_by_address(addr)
    }

    /// Returns the physical page with page number `num`.
    pub fn get_page_by_num(&self, num: usize) -> Option<Page> {
        self.default.get_page_by_num(num)
    }

    /// Returns the number of free physical pages.
    pub fn pages_available(&self) -> usize {
        self.default.free_page_count()
    }

    /// Returns the physical allocator.
    pub fn allocator(&self) -> &PageFrameAllocator {
        &self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::{DirectMap, NoReservations, Reserved},
        page::PageStatus,
        testing::host_memory,
    };

    const MEM_PAGES: usize = 64;

    /// Sets up a manager over `MEM_PAGES` pages of host memory, with the first four pages
    /// reserved and the bootstrap allocator covering pages 4 to 7.
    fn manager() -> (RegionManager, DirectMap) {
        let ops = host_memory(MEM_PAGES);
        let bootstrap = BumpFrameAllocator::new(Addr::from_page_num(4), Addr::from_page_num(8));
        let reserved = [MemoryRegion::from_pages(Addr::new(0), 4)];

        // SAFETY: physical memory is backed by leaked host memory
        let manager = unsafe {
            RegionManager::setup(
                MEM_PAGES * PAGE_SIZE + 100,
                &bootstrap,
                &reserved,
                &ops,
                AllocatorConfig::new(),
            )
        }
        .expect("physical setup failed");

        (manager, ops)
    }

    #[test]
    fn physical_setup() {
        let (manager, _) = manager();
        let allocator = manager.allocator();

        // Installed memory is rounded down to whole pages
        assert_eq!(allocator.total_pages(), MEM_PAGES);
        assert_eq!(allocator.kind(), AddressSpaceKind::Physical);

        // Four reserved pages, one for the descriptor table
        assert_eq!(allocator.metadata_region(), MemoryRegion::from_pages(Addr::from_page_num(4), 1));
        assert_eq!(manager.pages_available(), MEM_PAGES - 5);
        assert!(allocator.is_consistent());

        for num in 0..5 {
            let page = manager.get_page_by_num(num).unwrap();
            assert_eq!(allocator.status(page), Some(PageStatus::Used));
        }
        assert_eq!(manager.allocate_page_addr(AllocOptions::new()), Addr::from_page_num(5));
    }

    #[test]
    fn address_allocations() {
        let (manager, _) = manager();
        let before = manager.pages_available();

        let addr = manager.allocate_pages_addr(3, AllocOptions::contiguous());
        assert_eq!(addr, Addr::from_page_num(5));
        assert_eq!(manager.pages_available(), before - 3);

        let page = manager.get_phys_page(addr + 2 * PAGE_SIZE + 12).unwrap();
        assert_eq!(manager.allocator().address_of(page), Addr::from_page_num(7));

        manager.free_addr(addr);
        assert_eq!(manager.pages_available(), before);
    }

    #[test]
    fn region_rounds_up() {
        let (manager, _) = manager();
        let before = manager.pages_available();

        let page = manager.allocate_region(PAGE_SIZE + 1, AllocOptions::new());
        assert_eq!(manager.allocator().compound_len(page), 2);
        assert_eq!(manager.pages_available(), before - 2);

        manager.free(page);
        assert_eq!(manager.pages_available(), before);
    }

    #[test]
    #[should_panic(expected = "outside of physical memory")]
    fn free_outside_of_memory() {
        let (manager, _) = manager();
        manager.free_addr(Addr::from_page_num(MEM_PAGES));
    }

    #[test]
    fn wrap_existing_allocator() {
        let (manager, _) = manager();
        let before = manager.pages_available();

        let manager = RegionManager::new(manager.default);
        assert_eq!(manager.pages_available(), before);
        assert_eq!(manager.get_phys_page(Addr::from_page_num(MEM_PAGES)), None);
    }

    #[test]
    fn address_space_setup() {
        let (manager, ops) = manager();
        let before = manager.pages_available();

        let region = MemoryRegion::from_pages(Addr::new(0x4000_0000), 256);
        let reserved = [MemoryRegion::from_pages(Addr::new(0x4000_0000), 16)];

        // SAFETY: physical memory is backed by leaked host memory
        let space = unsafe {
            manager.setup_address_space(region, &Reserved(&reserved), &ops, AllocatorConfig::new())
        }
        .expect("address space setup failed");

        assert_eq!(space.kind(), AddressSpaceKind::Virtual);
        assert_eq!(space.free_page_count(), 256 - 16);

        // The descriptor table lives in labelled physical pages
        let table = space.metadata_region();
        let pages = table.page_count();
        assert_eq!(manager.pages_available(), before - pages);

        let first = manager.get_phys_page(table.start()).unwrap();
        assert_eq!(manager.allocator().compound_len(first), pages);
        assert_eq!(manager.allocator().debug_tag(first).unwrap().as_str(), "pfa-meta");

        // Virtual allocations are contiguous without asking
        let page = space.allocate_pages(4, AllocOptions::new());
        assert_eq!(space.address_of(page), Addr::new(0x4001_0000));
        assert_eq!(
            space.address_of(space.next_compound_page(page).unwrap()),
            Addr::new(0x4001_1000)
        );
    }

    #[test]
    fn address_space_without_physical_memory() {
        let (manager, ops) = manager();
        let huge = MemoryRegion::from_pages(Addr::new(0x8000_0000), 0x10_0000);

        // SAFETY: setup fails before touching memory
        let err = unsafe {
            manager.setup_address_space(huge, &NoReservations, &ops, AllocatorConfig::new())
        }
        .unwrap_err();

        assert!(matches!(err, SetupError::MetadataUnavailable { .. }));
        assert_eq!(manager.pages_available(), MEM_PAGES - 5);
    }

    #[test]
    fn failed_address_space_setup_releases_table() {
        let (manager, ops) = manager();
        let before = manager.pages_available();
        let region = MemoryRegion::from_pages(Addr::new(0x4000_0000), 256);

        // Descriptor tables are reached one byte off their natural alignment
        let skewed = DirectMap::new(ops.offset() + 1);

        // SAFETY: setup fails before touching memory
        let err = unsafe {
            manager.setup_address_space(region, &NoReservations, &skewed, AllocatorConfig::new())
        }
        .unwrap_err();

        assert_eq!(err, SetupError::UnalignedMetadata(Addr::from_page_num(5)));
        assert_eq!(manager.pages_available(), before);
        assert!(manager.allocator().is_consistent());

        for num in 5..8 {
            let page = manager.get_page_by_num(num).unwrap();
            assert_eq!(manager.allocator().status(page), Some(PageStatus::Free));
        }
    }
}
