//! The page frame allocator.
//!
//! The allocator keeps one [`PageDescriptor`] per page of its region in a flat table, and
//! threads the free ones on a circular list. Allocating a single page pops the head of the list,
//! freeing pages splices them back at its tail.
//!
//! Multi-page allocations which must be contiguous look for a run of address-consecutive pages
//! in free list order, starting from the head. List order is insertion order, so a fragmented
//! free list may hide runs that exist in the table; when the first search fails, the free list is
//! rebuilt in address order from a table scan (compaction) and searched once more.
//!
//! # Complexity
//!
//! Single page allocation and release are `O(1)`. Releasing an `n`-page allocation is `O(n)`.
//! Contiguous allocation is `O(free pages)`, twice that when compaction kicks in, plus an
//! `O(total pages)` scan for the compaction itself.

use core::{fmt, mem, slice};

use log::{debug, info, warn};
use spin::Mutex;

use crate::{
    addr::{Addr, AddressSpaceKind, MemoryRegion},
    allocator::{
        AllocError, AllocFlags, AllocOptions, InitialUsage, MemoryOps, MetadataSource,
        PageMarker, SetupError,
    },
    config::AllocatorConfig,
    free_list::FreeList,
    page::{DebugTag, Page, PageDescriptor, PageStatus, NIL},
    Align, PAGE_SIZE,
};

/// Label of the pages holding the descriptor table of another allocator.
const METADATA_LABEL: &str = "pfa-meta";

/// A page frame allocator for one region of an address space.
///
/// All mutating operations are serialized by a per-instance lock. Lookups which only need the
/// immutable layout of the table (address and index arithmetic) do not take the lock.
pub struct PageFrameAllocator {
    region: MemoryRegion,
    kind: AddressSpaceKind,
    first_page_num: usize,
    total_pages: usize,
    metadata: MemoryRegion,
    config: AllocatorConfig,
    frames: Mutex<Frames>,
}

/// The mutable state of an allocator.
struct Frames {
    table: &'static mut [PageDescriptor],
    free: FreeList,
    free_pages: usize,
    allocations: usize,
    compactions: usize,
}

impl PageFrameAllocator {
    /// Sets up an allocator managing the pages of `region`.
    ///
    /// The descriptor table is placed in memory obtained from `metadata`, which is made writable
    /// and zeroed through `ops`. Every page starts out free, then `usage` marks the pages already
    /// in use before the free list is built.
    ///
    /// Returns a `SetupError` if any of the following conditions are not met:
    ///  - `region` is page-aligned, non-empty and spans a whole number of pages,
    ///  - `region` does not extend past the top of the address space,
    ///  - `metadata` provides a suitably aligned region large enough for the table.
    ///
    /// # Safety
    ///
    /// The memory handed out by `metadata` must be reachable through `ops`, unused by anything
    /// else, and stay reserved for the whole lifetime of the kernel.
    ///
    /// # Panics
    ///
    /// Panics if the built free list does not account for all the free pages of the table.
    pub unsafe fn setup<S, U, O>(
        region: MemoryRegion,
        kind: AddressSpaceKind,
        config: AllocatorConfig,
        metadata: &S,
        usage: &U,
        ops: &O,
    ) -> Result<Self, SetupError>
    where
        S: MetadataSource + ?Sized,
        U: InitialUsage + ?Sized,
        O: MemoryOps + ?Sized,
    {
        if !region.start().is_aligned(PAGE_SIZE) {
            return Err(SetupError::UnalignedRegion(region.start()));
        }
        if !region.size().is_aligned(PAGE_SIZE) {
            return Err(SetupError::InvalidSize(region.size()));
        }

        let total_pages = region.size() / PAGE_SIZE;
        if total_pages == 0 {
            return Err(SetupError::EmptyRegion);
        }
        if region.start().as_usize().checked_add(region.size() - 1).is_none() {
            return Err(SetupError::WrapsAround(region.start()));
        }
        if total_pages >= NIL as usize {
            return Err(SetupError::TooManyPages(total_pages));
        }

        let size = total_pages * mem::size_of::<PageDescriptor>();
        let table_region = metadata
            .alloc_raw(size)
            .filter(|r| r.size() >= size)
            .ok_or(SetupError::MetadataUnavailable { size })?;

        let ptr = ops.as_mut_ptr(table_region.start()).cast::<PageDescriptor>();
        if ptr.align_offset(mem::align_of::<PageDescriptor>()) != 0 {
            return Err(SetupError::UnalignedMetadata(table_region.start()));
        }

        info!(
            "page frame array allocated {} pages, beginning with page {}",
            table_region.page_count(),
            table_region.start().page_num()
        );

        ops.set_writable(table_region);
        // SAFETY: the metadata source handed the region over to us and it is now writable
        unsafe { ops.zero(table_region) };

        for i in 0..total_pages {
            // SAFETY: the table region is large enough to hold `total_pages` descriptors
            unsafe { ptr.add(i).write(PageDescriptor::new(region.start() + i * PAGE_SIZE)) };
        }

        // SAFETY: all descriptors have been initialized above, and the caller guarantees that
        // the memory stays reserved to us for the lifetime of the kernel.
        let table = unsafe { slice::from_raw_parts_mut(ptr, total_pages) };

        let first_page_num = region.start().page_num();
        usage.mark(&mut PageMarker::new(table, first_page_num));

        let mut frames = Frames {
            table,
            free: FreeList::new(),
            free_pages: 0,
            allocations: 0,
            compactions: 0,
        };
        frames.rebuild_free_list();

        frames.free_pages = frames.table.iter().filter(|d| d.is_free()).count();
        assert_eq!(
            frames.free.len(frames.table),
            frames.free_pages,
            "free list does not match the page table"
        );

        info!("{:?} region {}: {} pages free", kind, region, frames.free_pages);

        Ok(Self {
            region,
            kind,
            first_page_num,
            total_pages,
            metadata: table_region,
            config,
            frames: Mutex::new(frames),
        })
    }

    /// Allocates a single page.
    ///
    /// # Panics
    ///
    /// Running out of memory is fatal: this function panics if no page is free.
    pub fn allocate_page(&self, options: AllocOptions<'_>) -> Page {
        self.allocate_pages(1, options)
    }

    /// Allocates `count` pages as a single compound allocation.
    ///
    /// The pages are contiguous if [`AllocFlags::CONTIGUOUS`] is set or if the allocator manages
    /// a virtual address space. Otherwise they may be scattered, and can be walked with
    /// [`next_compound_page`](Self::next_compound_page).
    ///
    /// # Panics
    ///
    /// Running out of memory is fatal: this function panics if the request cannot be satisfied.
    pub fn allocate_pages(&self, count: usize, options: AllocOptions<'_>) -> Page {
        match self.try_allocate_pages(count, options) {
            Ok(page) => page,
            Err(err) => panic!("{} ({:?} region {})", err, self.kind, self.region),
        }
    }

    /// Allocates `count` pages as a single compound allocation, returning an error on failure.
    ///
    /// See [`allocate_pages`](Self::allocate_pages).
    pub fn try_allocate_pages(
        &self,
        count: usize,
        options: AllocOptions<'_>,
    ) -> Result<Page, AllocError> {
        let contiguous =
            options.flags.contains(AllocFlags::CONTIGUOUS) || self.kind == AddressSpaceKind::Virtual;
        let compaction = self.config.compaction && !options.flags.contains(AllocFlags::NO_COMPACT);
        let tag = options.label.map_or(DebugTag::EMPTY, DebugTag::new);

        let mut frames = self.frames.lock();
        let first = frames.allocate(count, contiguous, compaction, tag)?;
        let free = frames.free_pages;
        drop(frames);

        let page = Page::new(first);
        if self.config.traces(count) {
            debug!(
                "allocated {} pages at {} {:?}, {} pages free",
                count,
                self.address_of(page),
                tag,
                free
            );
        }

        Ok(page)
    }

    /// Releases the allocation starting at `page`.
    ///
    /// All pages of the compound allocation are returned to the free list.
    ///
    /// # Panics
    ///
    /// When release checks are enabled, panics if `page` does not belong to this allocator or
    /// any page of its allocation is not in use. Without checks, double frees and foreign
    /// handles corrupt the free list.
    pub fn free(&self, page: Page) {
        let mut frames = self.frames.lock();
        let count = frames.release(page.raw(), self.config.checked_free);
        let free = frames.free_pages;
        drop(frames);

        if self.config.traces(count) {
            debug!(
                "freed {} pages at {}, {} pages free",
                count,
                self.address_of(page),
                free
            );
        }
    }

    /// Returns the page containing `addr`, or `None` if it lies outside of the region.
    pub fn get_page_by_address(&self, addr: Addr) -> Option<Page> {
        self.get_page_by_num(addr.page_num())
    }

    /// Returns the page with page number `num`, or `None` if it lies outside of the region.
    pub fn get_page_by_num(&self, num: usize) -> Option<Page> {
        self.get_page_by_index(num.checked_sub(self.first_page_num)?)
    }

    /// Returns the page at `index` in the descriptor table, or `None` if out of range.
    pub fn get_page_by_index(&self, index: usize) -> Option<Page> {
        if index < self.total_pages {
            Some(Page::new(index as u32))
        } else {
            None
        }
    }

    /// Returns the index in the descriptor table of the page containing `addr`.
    pub fn index_of(&self, addr: Addr) -> Option<usize> {
        self.get_page_by_address(addr).map(Page::index)
    }

    /// Returns the base address of `page`.
    pub fn address_of(&self, page: Page) -> Addr {
        self.region.start() + page.index() * PAGE_SIZE
    }

    /// Returns the page number of `page`.
    pub fn page_num(&self, page: Page) -> usize {
        self.first_page_num + page.index()
    }

    /// Returns the page following `page` in address order, if any.
    pub fn next_page(&self, page: Page) -> Option<Page> {
        self.get_page_by_index(page.index() + 1)
    }

    /// Returns the page following `page` in its compound allocation.
    ///
    /// The compound link is circular: the last page links back to the first one. Returns `None`
    /// if `page` is free or out of range.
    pub fn next_compound_page(&self, page: Page) -> Option<Page> {
        let frames = self.frames.lock();
        let descr = frames.table.get(page.index())?;

        match descr.status {
            PageStatus::Used => Some(Page::new(descr.compound)),
            PageStatus::Free => None,
        }
    }

    /// Returns the number of pages in the compound allocation containing `page`, or zero if
    /// `page` is free or out of range.
    pub fn compound_len(&self, page: Page) -> usize {
        let frames = self.frames.lock();
        match frames.table.get(page.index()) {
            Some(descr) if descr.status == PageStatus::Used => frames.compound_len(page.raw()),
            _ => 0,
        }
    }

    /// Returns the allocation status of `page`, or `None` if out of range.
    pub fn status(&self, page: Page) -> Option<PageStatus> {
        self.frames
            .lock()
            .table
            .get(page.index())
            .map(PageDescriptor::status)
    }

    /// Returns the label of the allocation owning `page`, or `None` if out of range.
    pub fn debug_tag(&self, page: Page) -> Option<DebugTag> {
        self.frames.lock().table.get(page.index()).map(|d| d.tag)
    }

    /// Returns `true` if `addr` lies within the managed region.
    pub fn contains(&self, addr: Addr) -> bool {
        self.region.contains(addr)
    }

    /// Returns `true` if `page` is a valid handle for this allocator.
    pub fn contains_page(&self, page: Page) -> bool {
        page.index() < self.total_pages
    }

    /// Returns the number of free pages.
    pub fn free_page_count(&self) -> usize {
        self.frames.lock().free_pages
    }

    /// Returns the total number of managed pages.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Returns the managed region.
    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    /// Returns the kind of address space managed by the allocator.
    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    /// Returns the region holding the descriptor table.
    pub fn metadata_region(&self) -> MemoryRegion {
        self.metadata
    }

    /// Returns the configuration of the allocator.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Returns the number of successful allocation requests so far.
    pub fn allocation_count(&self) -> usize {
        self.frames.lock().allocations
    }

    /// Returns the number of times the free list has been compacted.
    pub fn compaction_count(&self) -> usize {
        self.frames.lock().compactions
    }

    /// Walks the free list and returns its length.
    ///
    /// This is `O(free pages)` and intended for diagnostics.
    pub fn free_list_len(&self) -> usize {
        let frames = self.frames.lock();
        frames.free.len(frames.table)
    }

    /// Checks the bookkeeping of the allocator.
    ///
    /// Returns `true` if the free page counter, the number of free descriptors and the length of
    /// the free list agree, and the free list only holds free pages. This walks the whole table
    /// and is intended for diagnostics.
    pub fn is_consistent(&self) -> bool {
        let frames = self.frames.lock();

        let scanned = frames.table.iter().filter(|d| d.is_free()).count();
        let listed = frames.free.len(frames.table);
        let all_free = frames
            .free
            .iter(frames.table)
            .all(|idx| frames.table[idx as usize].is_free());

        scanned == frames.free_pages && listed == frames.free_pages && all_free
    }
}

impl Frames {
    /// Rebuilds the free list from a table scan, in address order.
    fn rebuild_free_list(&mut self) {
        self.free = FreeList::new();

        for idx in 0..self.table.len() {
            if self.table[idx].is_free() {
                self.free.push_back(self.table, idx as u32);
            }
        }
    }

    fn compact(&mut self) {
        self.rebuild_free_list();
        self.compactions += 1;

        debug_assert_eq!(self.free.len(self.table), self.free_pages);
        debug!("compacted free list: {} pages free", self.free_pages);
    }

    /// Looks for `count` address-consecutive pages in free list order, starting from the head.
    ///
    /// Returns the index of the first page of the run. No page is examined twice.
    fn find_run(&self, count: usize) -> Option<u32> {
        let head = self.free.head()?;

        let mut start = head;
        let mut prev = head;
        let mut run = 1;
        let mut examined = 1;

        while run < count {
            if examined >= self.free_pages {
                return None;
            }

            let next = self.table[prev as usize].link.next;
            examined += 1;

            if next == prev + 1 {
                run += 1;
            } else {
                start = next;
                run = 1;
            }
            prev = next;
        }

        Some(start)
    }

    /// Takes the head of the free list.
    fn pop(&mut self, tag: DebugTag) -> Option<u32> {
        let idx = self.free.pop_front(self.table)?;

        let descr = &mut self.table[idx as usize];
        descr.status = PageStatus::Used;
        descr.tag = tag;

        self.free_pages -= 1;
        Some(idx)
    }

    fn allocate(
        &mut self,
        count: usize,
        contiguous: bool,
        compaction: bool,
        tag: DebugTag,
    ) -> Result<u32, AllocError> {
        if count == 0 {
            return Err(AllocError::ZeroPages);
        }
        if count > self.free_pages {
            return Err(AllocError::OutOfMemory {
                requested: count,
                available: self.free_pages,
            });
        }

        if contiguous && count > 1 {
            let start = match self.find_run(count) {
                Some(start) => start,
                None if compaction => {
                    warn!("no run of {} contiguous pages on the free list", count);
                    self.compact();
                    self.find_run(count).ok_or(AllocError::NoContiguousRun {
                        requested: count,
                        available: self.free_pages,
                    })?
                }
                None => {
                    return Err(AllocError::NoContiguousRun {
                        requested: count,
                        available: self.free_pages,
                    })
                }
            };
            self.free.rotate_to(start);
        }

        let mut first = NIL;
        let mut last = NIL;

        for _ in 0..count {
            let Some(idx) = self.pop(tag) else {
                panic!(
                    "free list exhausted with {} pages accounted as free",
                    self.free_pages
                );
            };

            if first == NIL {
                first = idx;
            } else {
                self.table[last as usize].compound = idx;
            }
            self.table[idx as usize].compound = first;
            last = idx;
        }

        self.allocations += 1;
        Ok(first)
    }

    /// Returns the pages of the compound allocation starting at `first` to the free list.
    fn release(&mut self, first: u32, checked: bool) -> usize {
        if checked {
            self.check_allocated(first);
        }

        let mut chain = FreeList::new();
        let mut idx = first;
        let mut count = 0;

        loop {
            let descr = &mut self.table[idx as usize];
            let next = descr.compound;

            descr.status = PageStatus::Free;
            descr.tag = DebugTag::EMPTY;
            descr.compound = NIL;

            chain.push_back(self.table, idx);
            count += 1;

            if next == first {
                break;
            }
            idx = next;
        }

        self.free.append(self.table, &mut chain);
        self.free_pages += count;

        count
    }

    fn check_allocated(&self, first: u32) {
        assert!(
            (first as usize) < self.table.len(),
            "freeing page {} which is outside of this allocator",
            first
        );

        let mut idx = first;
        let mut visited = 0;

        loop {
            let descr = &self.table[idx as usize];
            assert!(
                descr.status == PageStatus::Used,
                "freeing page at {} which is not allocated",
                descr.address
            );

            visited += 1;
            assert!(
                visited <= self.table.len(),
                "compound chain of page {} is corrupted",
                first
            );

            idx = descr.compound;
            if idx == first {
                break;
            }
        }
    }

    fn compound_len(&self, first: u32) -> usize {
        let mut len = 1;
        let mut idx = self.table[first as usize].compound;

        while idx != first && len <= self.table.len() {
            len += 1;
            idx = self.table[idx as usize].compound;
        }

        len
    }
}

impl MetadataSource for PageFrameAllocator {
    fn alloc_raw(&self, size: usize) -> Option<MemoryRegion> {
        let count = size.div_ceil(PAGE_SIZE);
        let options = AllocOptions::contiguous().with_label(METADATA_LABEL);

        let page = self.try_allocate_pages(count, options).ok()?;
        Some(MemoryRegion::from_pages(self.address_of(page), count))
    }
}

impl fmt::Debug for PageFrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrameAllocator")
            .field("region", &self.region)
            .field("kind", &self.kind)
            .field("total_pages", &self.total_pages)
            .field("metadata", &self.metadata)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
