//! Page frame allocators and the interfaces they are set up through.
//!
//! A [`PageFrameAllocator`] does not know where its descriptor table lives nor which pages are
//! already taken when it comes up. Both are supplied at setup time by two strategies:
//!
//! - a [`MetadataSource`], which reserves raw memory for the descriptor table. The first
//!   physical allocator gets it from a [`BumpFrameAllocator`], later ones from an already
//!   running allocator;
//! - an [`InitialUsage`], which marks the pages already in use (kernel image, bootstrap
//!   allocations, the descriptor table itself) through a [`PageMarker`].
//!
//! Access to the descriptor table memory goes through [`MemoryOps`], the allocator's view of the
//! address translation layer.

use core::ptr;

use bitflags::bitflags;
use log::trace;
use thiserror::Error;

use crate::{
    addr::{Addr, MemoryRegion},
    page::{PageDescriptor, PageStatus},
};

pub use bump::BumpFrameAllocator;
pub use page_frame::PageFrameAllocator;

mod bump;
mod page_frame;

/// The error type returned by a failed allocator setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SetupError {
    /// The managed region does not start on a page boundary.
    #[error("region start {0} is not page-aligned")]
    UnalignedRegion(Addr),
    /// The managed region size is not a whole number of pages.
    #[error("region size {0:#x} is not a multiple of the page size")]
    InvalidSize(usize),
    /// The managed region has no pages.
    #[error("region is empty")]
    EmptyRegion,
    /// The managed region extends past the top of the address space.
    #[error("region at {0} wraps around the address space")]
    WrapsAround(Addr),
    /// The managed region has more pages than the descriptor links can index.
    #[error("region spans {0} pages, more than a descriptor table can index")]
    TooManyPages(usize),
    /// The metadata source could not provide memory for the descriptor table.
    #[error("no memory for a {size}-byte page descriptor table")]
    MetadataUnavailable {
        /// Size of the requested table in bytes.
        size: usize,
    },
    /// The memory provided for the descriptor table is not suitably aligned.
    #[error("page descriptor table at {0} is misaligned")]
    UnalignedMetadata(Addr),
}

/// The error type returned by a failed allocation.
///
/// Allocation failure is fatal for the `allocate_*` entry points; this type only surfaces
/// through [`PageFrameAllocator::try_allocate_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Fewer pages are free than requested.
    #[error("out of memory: requested {requested} pages, {available} available")]
    OutOfMemory {
        /// Number of pages requested.
        requested: usize,
        /// Number of free pages at the time of the request.
        available: usize,
    },
    /// Enough pages are free, but not as a contiguous run, even after compaction.
    #[error("out of memory: no run of {requested} contiguous pages, {available} available")]
    NoContiguousRun {
        /// Number of pages requested.
        requested: usize,
        /// Number of free pages at the time of the request.
        available: usize,
    },
    /// An allocation of zero pages was requested.
    #[error("requested an allocation of zero pages")]
    ZeroPages,
}

bitflags! {
    /// Flags altering the behavior of an allocation.
    pub struct AllocFlags: u32 {
        /// The pages must have consecutive addresses. Implied for virtual address spaces.
        const CONTIGUOUS = 1 << 0;
        /// Fail instead of compacting the free list when no contiguous run is found.
        const NO_COMPACT = 1 << 1;
    }
}

/// Options of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocOptions<'a> {
    /// Allocation flags.
    pub flags: AllocFlags,
    /// Label stored in the pages' descriptors for diagnostics.
    pub label: Option<&'a str>,
}

impl<'a> AllocOptions<'a> {
    /// Options for an unlabelled allocation with no flags set.
    pub const fn new() -> Self {
        Self {
            flags: AllocFlags::empty(),
            label: None,
        }
    }

    /// Options for an unlabelled allocation of contiguous pages.
    pub const fn contiguous() -> Self {
        Self {
            flags: AllocFlags::CONTIGUOUS,
            label: None,
        }
    }

    /// Adds `flags` to the options.
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the diagnostic label of the allocation.
    pub const fn with_label(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }
}

impl Default for AllocOptions<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// A provider of raw memory for page descriptor tables.
pub trait MetadataSource {
    /// Reserves at least `size` bytes of memory, returning the reserved region.
    ///
    /// Returns `None` if the memory cannot be provided. The region is expressed in the address
    /// space understood by the [`MemoryOps`] passed along to setup.
    fn alloc_raw(&self, size: usize) -> Option<MemoryRegion>;
}

impl<F> MetadataSource for F
where
    F: Fn(usize) -> Option<MemoryRegion>,
{
    fn alloc_raw(&self, size: usize) -> Option<MemoryRegion> {
        self(size)
    }
}

/// The pages already in use when an allocator is set up.
///
/// All pages start out free; implementations mark the ones to keep away from the free list.
pub trait InitialUsage {
    /// Marks the initial status of pages.
    fn mark(&self, pages: &mut PageMarker<'_>);
}

impl<F> InitialUsage for F
where
    F: Fn(&mut PageMarker<'_>),
{
    fn mark(&self, pages: &mut PageMarker<'_>) {
        self(pages)
    }
}

/// An [`InitialUsage`] leaving every page free.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReservations;

impl InitialUsage for NoReservations {
    fn mark(&self, _: &mut PageMarker<'_>) {}
}

/// An [`InitialUsage`] marking a fixed set of regions as used.
#[derive(Debug, Clone, Copy)]
pub struct Reserved<'a>(pub &'a [MemoryRegion]);

impl InitialUsage for Reserved<'_> {
    fn mark(&self, pages: &mut PageMarker<'_>) {
        for region in self.0 {
            pages.mark_used(*region);
        }
    }
}

/// Write access to the status of pages during allocator setup.
#[derive(Debug)]
pub struct PageMarker<'a> {
    table: &'a mut [PageDescriptor],
    first_page_num: usize,
}

impl<'a> PageMarker<'a> {
    pub(crate) fn new(table: &'a mut [PageDescriptor], first_page_num: usize) -> Self {
        Self {
            table,
            first_page_num,
        }
    }

    /// Marks all managed pages touched by `region` as used.
    ///
    /// Parts of `region` outside of the managed range are ignored. Returns the number of pages
    /// marked.
    pub fn mark_used(&mut self, region: MemoryRegion) -> usize {
        self.mark(region, PageStatus::Used)
    }

    /// Marks all managed pages touched by `region` as free.
    ///
    /// Parts of `region` outside of the managed range are ignored. Returns the number of pages
    /// marked.
    pub fn mark_free(&mut self, region: MemoryRegion) -> usize {
        self.mark(region, PageStatus::Free)
    }

    /// Returns the number of pages in the managed range.
    pub fn total_pages(&self) -> usize {
        self.table.len()
    }

    fn mark(&mut self, region: MemoryRegion, status: PageStatus) -> usize {
        let first = region.start().page_num().max(self.first_page_num);
        let last = (region.start().page_num() + region.page_count())
            .min(self.first_page_num + self.table.len());

        if first >= last {
            return 0;
        }

        for descr in &mut self.table[first - self.first_page_num..last - self.first_page_num] {
            descr.status = status;
        }

        last - first
    }
}

/// Access to memory through the kernel's address translation layer.
pub trait MemoryOps {
    /// Makes `region` writable in the kernel's address translation tables.
    fn set_writable(&self, region: MemoryRegion);

    /// Returns a pointer through which the kernel can access `addr`.
    fn as_mut_ptr(&self, addr: Addr) -> *mut u8;

    /// Fills `region` with zeros.
    ///
    /// # Safety
    ///
    /// `region` must be mapped, writable and not in use by anything else.
    unsafe fn zero(&self, region: MemoryRegion) {
        // SAFETY: assuming the caller has upheld the safety contract
        unsafe { ptr::write_bytes(self.as_mut_ptr(region.start()), 0, region.size()) };
    }
}

/// [`MemoryOps`] for memory linearly mapped at a fixed offset, e.g. physical memory in the
/// kernel's direct map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// A direct map where addresses are accessed as-is.
    pub const IDENTITY: Self = Self { offset: 0 };

    /// Creates a direct map at `offset` from the mapped addresses.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Returns the offset of the mapping.
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl MemoryOps for DirectMap {
    fn set_writable(&self, region: MemoryRegion) {
        // The direct map is always mapped read-write.
        trace!("direct map: {} already writable", region);
    }

    fn as_mut_ptr(&self, addr: Addr) -> *mut u8 {
        addr.as_usize().wrapping_add(self.offset) as *mut u8
    }
}
