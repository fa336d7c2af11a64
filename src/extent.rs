//! Mapped and unmapped block ranges of a file.
//!
//! An [`ExtentMapper`] wraps an open file and asks the kernel where its data
//! lives. Range queries are lazy: raw extents are fetched in batches while
//! the iterator is consumed, converted to block units and coalesced.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::{debug, trace};

use crate::config::{filesystem_block_size, validate_block_size};
use crate::error::{BmapError, Result};
use crate::range::{blocks_for, BlockRange, ExtentSet, Holes};
use crate::sys::{self, RawExtent};

/// Extent metadata query over one regular file.
///
/// # Example
///
/// ```rust,no_run
/// use bmapcopy::ExtentMapper;
///
/// let mapper = ExtentMapper::open("disk.img", None)?;
/// for range in mapper.mapped_ranges(0, mapper.blocks_count()) {
///     println!("mapped: {}", range?);
/// }
/// # Ok::<(), bmapcopy::BmapError>(())
/// ```
#[derive(Debug)]
pub struct ExtentMapper {
    file: File,
    block_size: u64,
    image_size: u64,
    blocks_count: u64,
}

impl ExtentMapper {
    /// Open `path` and check that it answers extent queries.
    ///
    /// With `block_size` set to `None` the filesystem's block size is used.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnreadable` if the file cannot be opened,
    /// `InvalidBlockSize` for a bad explicit block size, and
    /// `UnsupportedExtentQuery` if the file is not regular or the kernel
    /// refuses extent queries on it.
    pub fn open(path: impl AsRef<Path>, block_size: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| BmapError::unreadable(format!("image {}", path.display()), e))?;
        Self::with_owned(file, block_size)
    }

    /// Query an already open file. The handle is duplicated, not consumed.
    ///
    /// # Errors
    ///
    /// Same as [`ExtentMapper::open`].
    pub fn from_file(file: &File, block_size: Option<u64>) -> Result<Self> {
        let file = file
            .try_clone()
            .map_err(|e| BmapError::unreadable("image handle", e))?;
        Self::with_owned(file, block_size)
    }

    fn with_owned(file: File, block_size: Option<u64>) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|e| BmapError::unreadable("image metadata", e))?;

        let block_size = match block_size {
            Some(size) => {
                validate_block_size(size)?;
                size
            }
            None => filesystem_block_size(&metadata),
        };

        if !metadata.is_file() {
            return Err(BmapError::UnsupportedExtentQuery(
                "not a regular file".to_string(),
            ));
        }

        sys::check(&file).map_err(|e| BmapError::UnsupportedExtentQuery(e.to_string()))?;

        let image_size = metadata.len();
        let blocks_count = blocks_for(image_size, block_size);
        debug!(block_size, image_size, blocks_count, "Extent mapper ready");

        Ok(Self {
            file,
            block_size,
            image_size,
            blocks_count,
        })
    }

    /// Block size of the map.
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// File size in bytes at open time.
    #[must_use]
    pub const fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Number of blocks covering the file, last partial block included.
    #[must_use]
    pub const fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// Merged mapped ranges intersecting `[block_start, block_end)`.
    ///
    /// The iterator can be created any number of times; each one re-queries
    /// the kernel.
    #[must_use]
    pub fn mapped_ranges(&self, block_start: u64, block_end: u64) -> MappedRanges<'_> {
        let hi = block_end.min(self.blocks_count);
        let lo = block_start.min(hi);
        let raw = RawExtents {
            mapper: self,
            pos: lo * self.block_size,
            end: (hi * self.block_size).min(self.image_size),
            batch: Vec::new().into_iter(),
            done: lo >= hi,
        };
        MappedRanges {
            inner: Coalesce::new(raw, self.block_size, lo, hi),
        }
    }

    /// Unmapped ranges inside `[block_start, block_end)`.
    #[must_use]
    pub fn unmapped_ranges(&self, block_start: u64, block_end: u64) -> UnmappedRanges<'_> {
        let hi = block_end.min(self.blocks_count);
        let lo = block_start.min(hi);
        UnmappedRanges {
            inner: FallibleHoles::new(self.mapped_ranges(lo, hi), lo, hi),
        }
    }

    /// All mapped ranges of the file as a normalized set.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnreadable` if an extent query fails midway.
    pub fn extent_set(&self) -> Result<ExtentSet> {
        let mut set = ExtentSet::new(self.blocks_count);
        for range in self.mapped_ranges(0, self.blocks_count) {
            set.push(range?);
        }
        Ok(set)
    }
}

/// Batched fetch of raw byte extents over `[pos, end)`.
struct RawExtents<'a> {
    mapper: &'a ExtentMapper,
    pos: u64,
    end: u64,
    batch: std::vec::IntoIter<RawExtent>,
    done: bool,
}

impl RawExtents<'_> {
    fn refill(&mut self) -> io::Result<()> {
        let mut out = Vec::new();
        sys::fetch(&self.mapper.file, self.pos, self.end, &mut out)?;

        let Some(tail) = out.last() else {
            self.done = true;
            return Ok(());
        };

        let next = tail.end();
        if next <= self.pos || next >= self.end {
            self.done = true;
        }
        self.pos = next;

        trace!(extents = out.len(), next, "Fetched extent batch");
        self.batch = out.into_iter();
        Ok(())
    }
}

impl Iterator for RawExtents<'_> {
    type Item = io::Result<RawExtent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(extent) = self.batch.next() {
                return Some(Ok(extent));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Converts byte extents to block ranges within `[lo, hi)` and merges
/// touching ones. Input must be sorted by offset.
pub(crate) struct Coalesce<I> {
    inner: I,
    block_size: u64,
    lo: u64,
    hi: u64,
    pending: Option<BlockRange>,
    failed: bool,
}

impl<I> Coalesce<I> {
    pub(crate) const fn new(inner: I, block_size: u64, lo: u64, hi: u64) -> Self {
        Self {
            inner,
            block_size,
            lo,
            hi,
            pending: None,
            failed: false,
        }
    }

    fn to_blocks(extent: &RawExtent, block_size: u64, lo: u64, hi: u64) -> Option<BlockRange> {
        let start = extent.logical / block_size;
        let end = blocks_for(extent.end(), block_size);
        if start >= end {
            return None;
        }
        BlockRange { start, end }.clip(lo, hi)
    }
}

impl<I: Iterator<Item = io::Result<RawExtent>>> Iterator for Coalesce<I> {
    type Item = Result<BlockRange>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        for extent in self.inner.by_ref() {
            let extent = match extent {
                Ok(extent) => extent,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(BmapError::unreadable("image extents", e)));
                }
            };
            let Some(range) = Self::to_blocks(&extent, self.block_size, self.lo, self.hi) else {
                continue;
            };

            match self.pending.as_mut() {
                Some(prev) if prev.touches(&range) => {
                    prev.end = prev.end.max(range.end);
                }
                Some(prev) => {
                    let out = *prev;
                    self.pending = Some(range);
                    return Some(Ok(out));
                }
                None => self.pending = Some(range),
            }
        }

        self.pending.take().map(Ok)
    }
}

/// Iterator over merged mapped ranges. See [`ExtentMapper::mapped_ranges`].
pub struct MappedRanges<'a> {
    inner: Coalesce<RawExtents<'a>>,
}

impl Iterator for MappedRanges<'_> {
    type Item = Result<BlockRange>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Mapped ranges with the first error set aside, so [`Holes`] can walk them.
struct UntilError<I> {
    inner: I,
    error: Option<BmapError>,
}

impl<I: Iterator<Item = Result<BlockRange>>> Iterator for UntilError<I> {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        if self.error.is_some() {
            return None;
        }
        match self.inner.next()? {
            Ok(range) => Some(range),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

/// Gaps between fallible mapped ranges within a bound.
struct FallibleHoles<I> {
    holes: Holes<UntilError<I>>,
    failed: bool,
}

impl<I> FallibleHoles<I> {
    const fn new(mapped: I, start: u64, end: u64) -> Self {
        let mapped = UntilError {
            inner: mapped,
            error: None,
        };
        Self {
            holes: Holes::new(mapped, start, end),
            failed: false,
        }
    }
}

impl<I: Iterator<Item = Result<BlockRange>>> Iterator for FallibleHoles<I> {
    type Item = Result<BlockRange>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        // A failed query ends the mapped ranges early; the gap that produces
        // is not a real hole
        let gap = self.holes.next();
        if let Some(e) = self.holes.inner_mut().error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        gap.map(Ok)
    }
}

/// Iterator over unmapped ranges. See [`ExtentMapper::unmapped_ranges`].
pub struct UnmappedRanges<'a> {
    inner: FallibleHoles<MappedRanges<'a>>,
}

impl Iterator for UnmappedRanges<'_> {
    type Item = Result<BlockRange>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
