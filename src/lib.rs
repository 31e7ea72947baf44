//! Page frame allocation for the kernel memory manager.
//!
//! Every page of a managed region (physical RAM or a virtual address range) is described by a
//! [`PageDescriptor`](page::PageDescriptor) stored in a flat table. Free descriptors are threaded
//! on an index-linked circular list, which makes single page allocation and release `O(1)`.
//! Multi-page allocations are chained through a separate compound link so that they can be
//! walked and released as a unit.
//!
//! The entry point for the rest of the kernel is the [`RegionManager`](region::RegionManager),
//! which owns the physical [`PageFrameAllocator`](allocator::PageFrameAllocator) and can set up
//! further instances for virtual address spaces.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![deny(missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod allocator;
pub mod config;
pub mod page;
pub mod region;

mod free_list;

#[cfg(test)]
mod testing;

/// Length in bits of the offset part of the page.
pub const PAGE_SHIFT: usize = 12;

/// Length of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bitmask of the page number part of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// A trait for numeric types that can be aligned to a boundary.
pub trait Align<U> {
    /// Aligns address upwards to the specified bound.
    ///
    /// Returns the first address greater or equal than `addr` with alignment `align`.
    fn align_up(&self, align: U) -> Self;

    /// Aligns address downwards to the specified bound.
    ///
    /// Returns the first address lower or equal than `addr` with alignment `align`.
    fn align_down(&self, align: U) -> Self;

    /// Checks whether the address has the specified alignment.
    fn is_aligned(&self, align: U) -> bool;
}

impl Align<usize> for usize {
    fn align_up(&self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "Alignment must be a power of two");
        (self + align - 1) & !(align - 1)
    }

    fn align_down(&self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "Alignment must be a power of two");
        self & !(align - 1)
    }

    fn is_aligned(&self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "Alignment must be a power of two");
        (self & (align - 1)) == 0
    }
}
