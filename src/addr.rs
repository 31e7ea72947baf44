//! Memory address types.
//!
//! A page frame allocator is agnostic of the address space it manages, so a single [`Addr`]
//! type is used for both physical and virtual addresses. Which one a given allocator deals with
//! is recorded by its [`AddressSpaceKind`].

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::{Align, PAGE_SHIFT, PAGE_SIZE};

/// A memory address in the address space of an allocator.
///
/// This is a wrapper type around an `usize`, so it is always pointer-sized on any system.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Addr(usize);

impl Addr {
    /// Creates a new address.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the address of the first byte of page number `num`.
    pub const fn from_page_num(num: usize) -> Self {
        Self(num << PAGE_SHIFT)
    }

    /// Returns the inner representation of the address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the number of the page containing this address.
    pub const fn page_num(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl From<usize> for Addr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<Addr> for usize {
    fn from(addr: Addr) -> Self {
        addr.0
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({:#x})", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Addr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for Addr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl Add<usize> for Addr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for Addr {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub for Addr {
    type Output = usize;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Align<usize> for Addr {
    fn align_up(&self, align: usize) -> Self {
        Self(self.0.align_up(align))
    }

    fn align_down(&self, align: usize) -> Self {
        Self(self.0.align_down(align))
    }

    fn is_aligned(&self, align: usize) -> bool {
        self.0.is_aligned(align)
    }
}

/// The kind of address space managed by an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpaceKind {
    /// Installed RAM. Multi-page allocations may be scattered.
    Physical,
    /// The mapped range of an address space. Multi-page allocations are always contiguous.
    Virtual,
}

/// A contiguous range of memory, `[start, start + size)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    start: Addr,
    size: usize,
}

impl MemoryRegion {
    /// Creates a region of `size` bytes starting at `start`.
    pub const fn new(start: Addr, size: usize) -> Self {
        Self { start, size }
    }

    /// Creates a region spanning `count` whole pages starting at `start`.
    pub const fn from_pages(start: Addr, count: usize) -> Self {
        Self {
            start,
            size: count * PAGE_SIZE,
        }
    }

    /// Returns the first address of the region.
    pub const fn start(&self) -> Addr {
        self.start
    }

    /// Returns the size of the region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the first address past the end of the region.
    ///
    /// Returns `None` if the region extends to the top of the address space, where the end is
    /// not representable.
    pub const fn end(&self) -> Option<Addr> {
        match self.start.0.checked_add(self.size) {
            Some(end) => Some(Addr(end)),
            None => None,
        }
    }

    /// Returns the last address of the region, or `start` if the region is empty.
    pub const fn last(&self) -> Addr {
        Addr(self.start.0 + self.size.saturating_sub(1))
    }

    /// Returns `true` if the region has a size of zero.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the number of pages touched by the region, including partial ones.
    pub fn page_count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.last().page_num() - self.start.page_num() + 1
    }

    /// Returns `true` if `addr` lies within the region.
    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr.0 - self.start.0 < self.size
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[{:#x}-{:#x})", self.start.0, self.start.0)
        } else {
            write!(f, "[{:#x}-{:#x}]", self.start.0, self.last().0)
        }
    }
}
