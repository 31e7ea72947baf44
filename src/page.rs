//! Page handles and the page descriptor records backing them.

use core::fmt;

use crate::{addr::Addr, free_list::Link};

/// Index value marking the absence of a link.
pub(crate) const NIL: u32 = u32::MAX;

/// Maximum length in bytes of a [`DebugTag`].
pub const TAG_LEN: usize = 15;

/// Allocation status of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageStatus {
    /// The page is on the free list.
    Free = 0,
    /// The page belongs to a live allocation.
    Used = 1,
}

/// A handle to a page managed by a [`PageFrameAllocator`].
///
/// The handle is the index of the page in the allocator's descriptor table, so it is only
/// meaningful to the allocator it was obtained from.
///
/// [`PageFrameAllocator`]: crate::allocator::PageFrameAllocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Page(u32);

impl Page {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the index of the page in its allocator's descriptor table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

/// A short, human-readable label attached to an allocation for diagnostics.
///
/// Labels are stored inline in the page descriptor and truncated to [`TAG_LEN`] bytes on a
/// character boundary.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugTag {
    len: u8,
    buf: [u8; TAG_LEN],
}

impl DebugTag {
    /// A tag carrying no label.
    pub const EMPTY: Self = Self {
        len: 0,
        buf: [0; TAG_LEN],
    };

    /// Creates a tag from `label`, truncating it if needed.
    pub fn new(label: &str) -> Self {
        let mut end = label.len().min(TAG_LEN);
        while !label.is_char_boundary(end) {
            end -= 1;
        }

        let mut tag = Self::EMPTY;
        tag.buf[..end].copy_from_slice(&label.as_bytes()[..end]);
        tag.len = end as u8;
        tag
    }

    /// Returns the label.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or_default()
    }

    /// Returns `true` if no label is set.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for DebugTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DebugTag({:?})", self.as_str())
    }
}

impl fmt::Display for DebugTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A descriptor for a single page of the managed region.
///
/// Descriptors are created once at setup and live as long as their allocator. `link` threads the
/// free list while the page is free; `compound` chains the pages of a live allocation into a
/// ring.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct PageDescriptor {
    pub(crate) address: Addr,
    pub(crate) status: PageStatus,
    pub(crate) tag: DebugTag,
    pub(crate) link: Link,
    pub(crate) compound: u32,
}

impl PageDescriptor {
    pub(crate) const fn new(address: Addr) -> Self {
        Self {
            address,
            status: PageStatus::Free,
            tag: DebugTag::EMPTY,
            link: Link::UNLINKED,
            compound: NIL,
        }
    }

    /// Returns the base address of the page.
    pub const fn address(&self) -> Addr {
        self.address
    }

    /// Returns the allocation status of the page.
    pub const fn status(&self) -> PageStatus {
        self.status
    }

    /// Returns the label of the allocation owning the page, if any.
    pub const fn tag(&self) -> &DebugTag {
        &self.tag
    }

    /// Returns `true` if the page is free.
    pub fn is_free(&self) -> bool {
        self.status == PageStatus::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        let tag = DebugTag::new("kstack");
        assert_eq!(tag.as_str(), "kstack");
        assert!(!tag.is_empty());
        assert!(DebugTag::EMPTY.is_empty());
        assert_eq!(DebugTag::default(), DebugTag::EMPTY);
    }

    #[test]
    fn tag_truncation() {
        let tag = DebugTag::new("a-very-long-allocation-label");
        assert_eq!(tag.as_str(), "a-very-long-all");

        // 'é' is two bytes wide and would be split at the limit.
        let tag = DebugTag::new("aaaaaaaaaaaaaaé");
        assert_eq!(tag.as_str(), "aaaaaaaaaaaaaa");
    }

    #[test]
    fn fresh_descriptor() {
        let descr = PageDescriptor::new(Addr::new(0x2000));

        assert_eq!(descr.address(), Addr::new(0x2000));
        assert_eq!(descr.status(), PageStatus::Free);
        assert!(descr.is_free());
        assert!(descr.tag().is_empty());
        assert_eq!(descr.link, Link::UNLINKED);
        assert_eq!(descr.compound, NIL);
    }
}
