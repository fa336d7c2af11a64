//! Block ranges and merged extent sets.
//!
//! A [`BlockRange`] is a half-open interval of blocks. An [`ExtentSet`] is the
//! normalized list of mapped ranges of one image: sorted, non-overlapping,
//! never touching, and bounded by the image's block count.

use std::fmt;

/// Half-open block interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRange {
    /// First block of the range.
    pub start: u64,
    /// One past the last block of the range.
    pub end: u64,
}

impl BlockRange {
    /// Create a new range.
    ///
    /// # Panics
    ///
    /// Panics if `start >= end`.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        assert!(start < end, "Block range must not be empty");
        Self { start, end }
    }

    /// Number of blocks in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range holds no blocks.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Inclusive last block.
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.end - 1
    }

    /// Byte offset of the first block.
    #[must_use]
    pub const fn byte_start(&self, block_size: u64) -> u64 {
        self.start * block_size
    }

    /// Exclusive byte end, with the final block clipped to `image_size`.
    #[must_use]
    pub fn byte_end(&self, block_size: u64, image_size: u64) -> u64 {
        (self.end * block_size).min(image_size)
    }

    /// Number of image bytes covered by the range.
    #[must_use]
    pub fn byte_len(&self, block_size: u64, image_size: u64) -> u64 {
        self.byte_end(block_size, image_size)
            .saturating_sub(self.byte_start(block_size))
    }

    /// Intersection with `[start, end)`, if non-empty.
    #[must_use]
    pub fn clip(&self, start: u64, end: u64) -> Option<Self> {
        let s = self.start.max(start);
        let e = self.end.min(end);
        (s < e).then_some(Self { start: s, end: e })
    }

    /// Whether the two ranges overlap or touch.
    #[must_use]
    pub const fn touches(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Displayed with an inclusive end, as in the manifest: `first-last`, or a
/// bare block number for one-block ranges.
impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len() == 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.last())
        }
    }
}

/// Number of blocks needed to hold `size` bytes.
#[must_use]
pub const fn blocks_for(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

/// Normalized set of mapped block ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtentSet {
    ranges: Vec<BlockRange>,
    total_blocks: u64,
}

impl ExtentSet {
    /// Empty set over an image of `total_blocks` blocks.
    #[must_use]
    pub const fn new(total_blocks: u64) -> Self {
        Self {
            ranges: Vec::new(),
            total_blocks,
        }
    }

    /// Set where every block is mapped.
    #[must_use]
    pub fn full(total_blocks: u64) -> Self {
        let mut set = Self::new(total_blocks);
        if total_blocks > 0 {
            set.ranges.push(BlockRange::new(0, total_blocks));
        }
        set
    }

    /// Build a set from arbitrary ranges: sorts, merges and clips them.
    #[must_use]
    pub fn from_ranges<I>(total_blocks: u64, ranges: I) -> Self
    where
        I: IntoIterator<Item = BlockRange>,
    {
        let mut sorted: Vec<BlockRange> = ranges.into_iter().collect();
        sorted.sort_unstable();

        let mut set = Self::new(total_blocks);
        for range in sorted {
            set.push(range);
        }
        set
    }

    /// Append a range that starts at or after the start of the last one.
    ///
    /// Touching or overlapping ranges are merged, and anything past the
    /// block count is dropped.
    pub fn push(&mut self, range: BlockRange) {
        let Some(range) = range.clip(0, self.total_blocks) else {
            return;
        };

        if let Some(prev) = self.ranges.last_mut() {
            debug_assert!(prev.start <= range.start, "ranges must be pushed in order");
            if prev.touches(&range) {
                prev.end = prev.end.max(range.end);
                return;
            }
        }
        self.ranges.push(range);
    }

    /// Mapped ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    /// Total number of blocks of the image.
    #[must_use]
    pub const fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Number of mapped blocks.
    #[must_use]
    pub fn mapped_blocks(&self) -> u64 {
        self.ranges.iter().map(BlockRange::len).sum()
    }

    /// Whether no block is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Unmapped ranges, i.e. the complement within `[0, total_blocks)`.
    pub fn holes(&self) -> Holes<std::iter::Copied<std::slice::Iter<'_, BlockRange>>> {
        Holes::new(self.ranges.iter().copied(), 0, self.total_blocks)
    }
}

/// Iterator over the gaps between successive mapped ranges within a bound.
#[derive(Debug)]
pub struct Holes<I> {
    mapped: I,
    cursor: u64,
    end: u64,
}

impl<I> Holes<I> {
    pub(crate) const fn new(mapped: I, start: u64, end: u64) -> Self {
        Self {
            mapped,
            cursor: start,
            end,
        }
    }

    pub(crate) fn inner_mut(&mut self) -> &mut I {
        &mut self.mapped
    }
}

impl<I: Iterator<Item = BlockRange>> Iterator for Holes<I> {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        while self.cursor < self.end {
            match self.mapped.next() {
                Some(range) => {
                    let gap = BlockRange {
                        start: self.cursor,
                        end: range.start.min(self.end),
                    };
                    self.cursor = self.cursor.max(range.end);
                    if gap.start < gap.end {
                        return Some(gap);
                    }
                }
                None => {
                    let gap = BlockRange {
                        start: self.cursor,
                        end: self.end,
                    };
                    self.cursor = self.end;
                    return Some(gap);
                }
            }
        }
        None
    }
}
