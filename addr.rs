//! Address ranges and page arithmetic.
//!
//! Every offset the engine handles travels together with the range it belongs
//! to. [`AddrRange`] is a half-open `[start, start + len)` interval over the
//! process address space and [`PageSize`] carries the alignment rules.

use std::fmt;

/// A power-of-two page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(usize);

impl PageSize {
    /// Page size used when the host cannot be queried.
    pub const DEFAULT: PageSize = PageSize(4096);

    /// Create a page size, returning `None` unless `size` is a non-zero power of two.
    pub fn new(size: usize) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size))
    }

    /// Size in bytes.
    pub fn get(self) -> usize {
        self.0
    }

    fn mask(self) -> usize {
        !(self.0 - 1)
    }

    /// Round `addr` down to the start of its page.
    pub fn align_down(self, addr: usize) -> usize {
        addr & self.mask()
    }

    /// Round `addr` up to the next page boundary (identity on aligned addresses).
    pub fn align_up(self, addr: usize) -> usize {
        addr.saturating_add(self.0 - 1) & self.mask()
    }

    /// Whether `addr` is page-aligned.
    pub fn is_aligned(self, addr: usize) -> bool {
        addr & (self.0 - 1) == 0
    }

    /// Round a length down to a whole number of pages.
    pub fn whole_pages(self, len: usize) -> usize {
        len & self.mask()
    }
}

/// Half-open address interval `[start, start + len)`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrRange {
    pub start: usize,
    pub len: usize,
}

impl AddrRange {
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// Build a range from its two bounds. `end` below `start` yields an empty range.
    pub fn from_bounds(start: usize, end: usize) -> Self {
        Self::new(start, end.saturating_sub(start))
    }

    pub fn from_ptr<T>(ptr: *const T, len: usize) -> Self {
        Self::new(ptr as usize, len)
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &AddrRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Sub-range starting `offset` bytes in, clamped to this range.
    pub fn skip(&self, offset: usize) -> AddrRange {
        let offset = offset.min(self.len);
        AddrRange::new(self.start + offset, self.len - offset)
    }

    /// Leading sub-range of at most `len` bytes.
    pub fn take(&self, len: usize) -> AddrRange {
        AddrRange::new(self.start, len.min(self.len))
    }

    /// The largest page-aligned range inside this one (may be empty).
    pub fn page_core(&self, page: PageSize) -> AddrRange {
        let start = page.align_up(self.start);
        let end = page.align_down(self.end());
        AddrRange::from_bounds(start, end)
    }

    /// The smallest page-aligned range containing this one.
    pub fn page_cover(&self, page: PageSize) -> AddrRange {
        if self.is_empty() {
            return AddrRange::new(page.align_down(self.start), 0);
        }
        AddrRange::from_bounds(page.align_down(self.start), page.align_up(self.end()))
    }

    /// Bytes in front of the first page boundary.
    pub fn leading_fringe(&self, page: PageSize) -> usize {
        (page.align_up(self.start) - self.start).min(self.len)
    }

    /// Page containing `addr`.
    pub fn page_of(addr: usize, page: PageSize) -> AddrRange {
        AddrRange::new(page.align_down(addr), page.get())
    }
}

impl fmt::Debug for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: PageSize = PageSize::DEFAULT;

    #[test]
    fn test_alignment() {
        assert_eq!(PAGE.align_down(0x1fff), 0x1000);
        assert_eq!(PAGE.align_up(0x1001), 0x2000);
        assert_eq!(PAGE.align_up(0x2000), 0x2000);
        assert!(PAGE.is_aligned(0x3000));
        assert!(!PAGE.is_aligned(0x3001));
        assert_eq!(PAGE.whole_pages(8191), 4096);
        assert!(PageSize::new(3000).is_none());
    }

    #[test]
    fn test_fringes() {
        let r = AddrRange::new(0x1010, 3 * 4096);
        assert_eq!(r.leading_fringe(PAGE), 0x1000 - 0x10);
        assert_eq!(r.page_core(PAGE), AddrRange::new(0x2000, 2 * 4096));
        assert_eq!(r.page_cover(PAGE), AddrRange::new(0x1000, 4 * 4096));

        let aligned = AddrRange::new(0x4000, 8192);
        assert_eq!(aligned.leading_fringe(PAGE), 0);
        assert_eq!(aligned.page_core(PAGE), aligned);
    }

    #[test]
    fn test_small_range_has_empty_core() {
        let r = AddrRange::new(0x1010, 100);
        assert!(r.page_core(PAGE).is_empty());
        assert_eq!(r.leading_fringe(PAGE), 100);
    }

    #[test]
    fn test_overlap_and_containment() {
        let a = AddrRange::new(0x1000, 0x2000);
        let b = AddrRange::new(0x2000, 0x2000);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&AddrRange::new(0x3000, 10)));
        assert!(a.contains(0x2fff));
        assert!(!a.contains(0x3000));
        assert!(a.covers(&AddrRange::new(0x1800, 0x100)));
        assert!(a.covers(&a));
        assert!(!a.covers(&b));
        assert_eq!(a.skip(0x1000), AddrRange::new(0x2000, 0x1000));
        assert_eq!(a.skip(0x9000).len, 0);
        assert_eq!(a.take(0x10), AddrRange::new(0x1000, 0x10));
    }
}
