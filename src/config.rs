//! Tunables of a page frame allocator instance.

/// Default minimum page count of an allocation or release to be logged.
pub const DEFAULT_TRACE_THRESHOLD: usize = 8;

/// Configuration of a [`PageFrameAllocator`](crate::allocator::PageFrameAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Allocations and releases of at least this many pages are logged at debug level.
    pub trace_threshold: usize,
    /// Verify on release that every page of the allocation is in use.
    pub checked_free: bool,
    /// Allow contiguous allocations to rebuild the free list when the first search fails.
    pub compaction: bool,
}

impl AllocatorConfig {
    /// Creates the default configuration.
    ///
    /// Release checks are enabled in debug builds only.
    pub const fn new() -> Self {
        Self {
            trace_threshold: DEFAULT_TRACE_THRESHOLD,
            checked_free: cfg!(debug_assertions),
            compaction: true,
        }
    }

    /// Sets the minimum page count of logged allocations.
    pub const fn with_trace_threshold(mut self, pages: usize) -> Self {
        self.trace_threshold = pages;
        self
    }

    /// Enables or disables release checks.
    pub const fn with_checked_free(mut self, enabled: bool) -> Self {
        self.checked_free = enabled;
        self
    }

    /// Enables or disables the compaction fallback of contiguous allocations.
    pub const fn with_compaction(mut self, enabled: bool) -> Self {
        self.compaction = enabled;
        self
    }

    pub(crate) const fn traces(&self, pages: usize) -> bool {
        pages >= self.trace_threshold
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
